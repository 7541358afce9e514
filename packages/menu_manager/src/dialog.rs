//! Dialog coordination between the local user and remote parties.
//!
//! One dialog at a time, with a fixed pair of buttons. A dialog shown in
//! `Regular` mode is mirrored to remotes and button presses are forwarded
//! as `Dialog(Action)`. In `LocalDelegateLocked` mode the local delegate
//! decides everything and remote dialog traffic is ignored while it is open.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use menu_remote::{CommandSender, CorrelationId, DialogMode, MenuButtonType, MenuCommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogState {
    Hidden,
    LocallyShown,
    RemotelyShown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogShowMode {
    #[default]
    Regular,
    LocalDelegateLocked,
}

/// Called on a local button press. Returning `true` closes the dialog.
pub type DialogDelegate = Arc<dyn Fn(MenuButtonType) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DialogSnapshot {
    pub state: DialogState,
    pub mode: DialogShowMode,
    pub header: String,
    pub message: String,
    pub button1: MenuButtonType,
    pub button2: MenuButtonType,
}

impl DialogSnapshot {
    fn hidden() -> Self {
        Self {
            state: DialogState::Hidden,
            mode: DialogShowMode::Regular,
            header: String::new(),
            message: String::new(),
            button1: MenuButtonType::None,
            button2: MenuButtonType::None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state != DialogState::Hidden
    }
}

/// What a local button press did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonOutcome {
    Closed,
    KeptOpen,
    /// Sent to the remote side, which decides whether to close.
    Forwarded(CorrelationId),
    /// No dialog was open.
    Ignored,
}

struct Inner {
    view: DialogSnapshot,
    delegate: Option<DialogDelegate>,
}

pub struct DialogManager {
    inner: Mutex<Inner>,
    channel: Mutex<Option<Weak<dyn CommandSender>>>,
    updates: watch::Sender<DialogSnapshot>,
}

impl fmt::Debug for DialogManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogManager")
            .field("view", &lock(&self.inner).view)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for DialogManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DialogManager {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(DialogSnapshot::hidden());
        Self {
            inner: Mutex::new(Inner {
                view: DialogSnapshot::hidden(),
                delegate: None,
            }),
            channel: Mutex::new(None),
            updates,
        }
    }

    /// Use `channel` for mirroring dialogs. Held weakly.
    pub fn set_channel<C>(&self, channel: &Arc<C>)
    where
        C: CommandSender + 'static,
    {
        let weak: Weak<dyn CommandSender> = Arc::downgrade(channel) as Weak<dyn CommandSender>;
        *lock(&self.channel) = Some(weak);
    }

    pub fn snapshot(&self) -> DialogSnapshot {
        lock(&self.inner).view.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DialogSnapshot> {
        self.updates.subscribe()
    }

    pub fn show_local(
        &self,
        mode: DialogShowMode,
        header: impl Into<String>,
        message: impl Into<String>,
        button1: MenuButtonType,
        button2: MenuButtonType,
        delegate: Option<DialogDelegate>,
    ) {
        let view = {
            let mut inner = lock(&self.inner);
            inner.view = DialogSnapshot {
                state: DialogState::LocallyShown,
                mode,
                header: header.into(),
                message: message.into(),
                button1,
                button2,
            };
            inner.delegate = delegate;
            inner.view.clone()
        };
        debug!(header = %view.header, ?mode, "dialog shown locally");

        if mode == DialogShowMode::Regular {
            self.send(MenuCommand::Dialog {
                mode: DialogMode::Show,
                header: view.header.clone(),
                message: view.message.clone(),
                button1: view.button1,
                button2: view.button2,
                correlation: CorrelationId::EMPTY,
            });
        }
        self.updates.send_replace(view);
    }

    /// Close the dialog locally and tell remotes.
    pub fn hide(&self) {
        let was = self.close();
        if was.as_ref().is_some_and(|v| v.mode == DialogShowMode::Regular) {
            self.send(MenuCommand::Dialog {
                mode: DialogMode::Hide,
                header: String::new(),
                message: String::new(),
                button1: MenuButtonType::None,
                button2: MenuButtonType::None,
                correlation: CorrelationId::EMPTY,
            });
        }
    }

    /// Apply a dialog command from a remote. Returns whether it was applied.
    pub fn handle_remote(&self, cmd: &MenuCommand) -> bool {
        let MenuCommand::Dialog {
            mode,
            header,
            message,
            button1,
            button2,
            ..
        } = cmd
        else {
            return false;
        };

        let view = {
            let mut inner = lock(&self.inner);
            if inner.view.is_open() && inner.view.mode == DialogShowMode::LocalDelegateLocked {
                debug!(?mode, "dialog locked by local delegate, remote command ignored");
                return false;
            }
            match mode {
                DialogMode::Show => {
                    inner.view = DialogSnapshot {
                        state: DialogState::RemotelyShown,
                        mode: DialogShowMode::Regular,
                        header: header.clone(),
                        message: message.clone(),
                        button1: *button1,
                        button2: *button2,
                    };
                    inner.delegate = None;
                }
                DialogMode::Hide | DialogMode::Action => {
                    if !inner.view.is_open() {
                        return false;
                    }
                    inner.view = DialogSnapshot::hidden();
                    inner.delegate = None;
                }
            }
            inner.view.clone()
        };
        self.updates.send_replace(view);
        true
    }

    pub fn button_pressed(&self, button: MenuButtonType) -> ButtonOutcome {
        let (view, delegate) = {
            let inner = lock(&self.inner);
            (inner.view.clone(), inner.delegate.clone())
        };
        if !view.is_open() {
            return ButtonOutcome::Ignored;
        }

        match view.mode {
            DialogShowMode::LocalDelegateLocked => {
                let close = delegate.is_some_and(|d| d(button));
                if close {
                    self.close();
                    ButtonOutcome::Closed
                } else {
                    ButtonOutcome::KeptOpen
                }
            }
            DialogShowMode::Regular => {
                let Some(channel) = self.channel() else {
                    if let Some(delegate) = delegate {
                        delegate(button);
                    }
                    self.close();
                    return ButtonOutcome::Closed;
                };
                let correlation = CorrelationId::new_random();
                let action = MenuCommand::Dialog {
                    mode: DialogMode::Action,
                    header: view.header,
                    message: view.message,
                    button1: button,
                    button2: MenuButtonType::None,
                    correlation,
                };
                match channel.send_command(action) {
                    Ok(()) => ButtonOutcome::Forwarded(correlation),
                    Err(e) => {
                        warn!(error = %e, "dialog action not sent, closing locally");
                        self.close();
                        ButtonOutcome::Closed
                    }
                }
            }
        }
    }

    fn close(&self) -> Option<DialogSnapshot> {
        let previous = {
            let mut inner = lock(&self.inner);
            if !inner.view.is_open() {
                return None;
            }
            inner.delegate = None;
            std::mem::replace(&mut inner.view, DialogSnapshot::hidden())
        };
        self.updates.send_replace(DialogSnapshot::hidden());
        Some(previous)
    }

    fn channel(&self) -> Option<Arc<dyn CommandSender>> {
        lock(&self.channel).as_ref().and_then(Weak::upgrade)
    }

    fn send(&self, cmd: MenuCommand) {
        if let Some(channel) = self.channel() {
            if let Err(e) = channel.send_command(cmd) {
                debug!(error = %e, "dialog command not sent");
            }
        }
    }
}
