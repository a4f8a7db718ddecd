use std::path::{Path, PathBuf};

use tracing::debug;

use crate::content::FileContent;

/// The lifecycle state of one open document. There is no terminal state: a
/// session is `Initializing` until the host's first content arrives and then
/// moves between the other four until it's closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the host to provide initial content.
    Initializing,
    /// The buffer matches the last content this session persisted.
    Clean,
    /// The buffer has edits that haven't reached the disk.
    Dirty,
    /// A save request is in flight to the host.
    Saving,
    /// The file changed externally while the buffer had unsaved edits; the
    /// user has to pick a side.
    ConflictPending,
}

/// The user's answer to a conflict: keep what's in the buffer, or adopt what
/// appeared on disk. Whole-document choice; there is no merging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictChoice {
    KeepLocal,
    AcceptExternal,
}

/// Everything that can happen to a session. `HostUpdate` covers the initial
/// load, external changes, and echoes of our own saves alike: the machine
/// classifies them by content, not by trusting a label.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Authoritative content from the host.
    HostUpdate { content: FileContent },
    /// The host couldn't produce initial content (too large, undecodable).
    LoadFailed { message: String },
    /// The user changed the buffer.
    UserEdit { content: FileContent },
    /// The editing-idle timer fired: the user has stopped typing.
    EditingIdle,
    /// The autosave timer fired, or the user explicitly asked to save.
    SaveRequested,
    /// The host persisted the given content for this session.
    SaveCompleted { content: FileContent },
    /// The host gave up on persisting our save.
    SaveFailed { message: String },
    ResolveConflict(ConflictChoice),
    /// The session is being torn down.
    Close,
}

/// What a transition asks the runtime to do. Every externally visible action
/// of a session is one of these, returned from [`EditSession::apply`]; the
/// machine itself never touches a timer, a channel, or the bridge.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEffect {
    /// (Re)start the autosave debounce timer.
    ScheduleAutosave,
    /// Stop any running autosave timer.
    CancelAutosave,
    /// (Re)start the editing-idle timer.
    StartEditingIdle,
    /// Send the given content to the host for persistence.
    SendSaveRequest { content: FileContent },
    /// The buffer was replaced wholesale (initial load, accepted external
    /// change); the UI should re-render and restore its cursor.
    BufferReplaced { content: FileContent },
    /// Present both sides of a conflict to the user.
    ConflictPresented {
        local: FileContent,
        external: FileContent,
    },
}

/// The per-document state machine on the view side. Owns the buffer and the
/// two reference contents everything is judged against:
///
/// - `last_saved`: what this session most recently persisted; the buffer
///   differing from it is what "dirty" means.
/// - `last_external`: what we most recently understood the disk to hold,
///   whether from the initial load, an accepted external change, or the echo
///   of our own save.
///
/// One event is applied at a time, to completion, so the invariants hold
/// between any two calls without locking: `dirty ⇔ buffer ≠ last_saved`,
/// `Saving ⇒ pending_save` is the submitted content, and `ConflictPending ⇒
/// dirty ∧ buffer ≠ last_external`.
pub struct EditSession {
    path: PathBuf,
    state: SessionState,
    buffer: FileContent,
    last_saved: FileContent,
    last_external: FileContent,
    /// Content of the in-flight save, used to identify echoes: a host update
    /// equal to this is our own write coming back, not an external change.
    pending_save: Option<FileContent>,
    /// True for a short window after each keystroke. External changes are
    /// deferred, never surfaced, while this holds.
    user_editing: bool,
    /// An external change arrived while we couldn't surface it (mid-edit or
    /// mid-save); `last_external` holds it and we owe a decision once things
    /// settle.
    deferred_external: bool,
}

impl EditSession {
    /// Creates a session for the given path, waiting on initial content.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: SessionState::Initializing,
            buffer: FileContent::empty(),
            last_saved: FileContent::empty(),
            last_external: FileContent::empty(),
            pending_save: None,
            user_editing: false,
            deferred_external: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn buffer(&self) -> &FileContent {
        &self.buffer
    }
    pub fn last_saved(&self) -> &FileContent {
        &self.last_saved
    }
    pub fn last_external(&self) -> &FileContent {
        &self.last_external
    }
    /// Whether the buffer holds edits that haven't been persisted.
    pub fn dirty(&self) -> bool {
        self.buffer != self.last_saved
    }
    pub fn is_user_editing(&self) -> bool {
        self.user_editing
    }

    /// Applies one event and returns the effects the runtime must perform.
    /// This is the only place any session field changes.
    pub fn apply(&mut self, event: SessionEvent) -> Vec<SessionEffect> {
        let effects = match event {
            SessionEvent::HostUpdate { content } => self.on_host_update(content),
            SessionEvent::LoadFailed { message } => {
                // Stay in `Initializing`; there's nothing to edit and nothing
                // to lose
                debug!(path = ?self.path, %message, "initial load failed");
                Vec::new()
            }
            SessionEvent::UserEdit { content } => self.on_user_edit(content),
            SessionEvent::EditingIdle => self.on_editing_idle(),
            SessionEvent::SaveRequested => self.on_save_requested(),
            SessionEvent::SaveCompleted { content } => self.on_save_completed(content),
            SessionEvent::SaveFailed { message } => self.on_save_failed(message),
            SessionEvent::ResolveConflict(choice) => self.on_resolve_conflict(choice),
            SessionEvent::Close => {
                self.user_editing = false;
                vec![SessionEffect::CancelAutosave]
            }
        };
        self.debug_check_invariants();
        effects
    }

    fn on_host_update(&mut self, content: FileContent) -> Vec<SessionEffect> {
        // Initial load: adopt wholesale
        if self.state == SessionState::Initializing {
            self.buffer = content.clone();
            self.last_saved = content.clone();
            self.last_external = content.clone();
            self.state = SessionState::Clean;
            return vec![SessionEffect::BufferReplaced { content }];
        }

        // Echo of our own in-flight save: update what we know about the
        // disk, and *never* touch the buffer. The user may have kept typing
        // since the save was submitted, and clobbering those keystrokes is
        // exactly the bug this comparison exists to prevent
        if self.pending_save.as_ref() == Some(&content) {
            self.last_saved = content.clone();
            self.last_external = content;
            if self.state != SessionState::Saving {
                self.state = if self.dirty() {
                    SessionState::Dirty
                } else {
                    SessionState::Clean
                };
            }
            debug!(path = ?self.path, "host update matched pending save, treated as echo");
            return Vec::new();
        }

        // A repeat of what we already consider the disk state carries no new
        // information
        if content == self.last_external {
            return Vec::new();
        }

        // A real external change. While the user is mid-edit (or a save is
        // in flight), record it and stay quiet; surfacing a conflict dialog
        // under someone's fingers loses keystrokes either way
        if self.user_editing || self.state == SessionState::Saving {
            self.last_external = content;
            self.deferred_external = true;
            debug!(path = ?self.path, "deferred external change");
            return Vec::new();
        }

        self.last_external = content.clone();
        match self.state {
            SessionState::Clean => {
                // No unsaved edits: accept the external content in place
                self.buffer = content.clone();
                self.last_saved = content.clone();
                vec![SessionEffect::BufferReplaced { content }]
            }
            SessionState::Dirty | SessionState::ConflictPending => {
                if self.buffer == content {
                    // The user already typed exactly what appeared on disk;
                    // nothing is actually in conflict
                    self.last_saved = content;
                    self.state = SessionState::Clean;
                    return vec![SessionEffect::CancelAutosave];
                }
                self.state = SessionState::ConflictPending;
                vec![
                    SessionEffect::CancelAutosave,
                    SessionEffect::ConflictPresented {
                        local: self.buffer.clone(),
                        external: content,
                    },
                ]
            }
            // Handled above
            SessionState::Initializing | SessionState::Saving => unreachable!(),
        }
    }

    fn on_user_edit(&mut self, content: FileContent) -> Vec<SessionEffect> {
        if self.state == SessionState::Initializing {
            // There's no document yet to edit; the UI shouldn't let this
            // happen, and we won't invent a buffer for it
            debug!(path = ?self.path, "ignored edit before initial load");
            return Vec::new();
        }

        self.buffer = content;
        self.user_editing = true;
        let mut effects = vec![SessionEffect::StartEditingIdle];

        match self.state {
            SessionState::Saving => {
                // Keep the edit; a fresh autosave is scheduled when the
                // in-flight save completes and finds the buffer moved on
            }
            SessionState::ConflictPending => {
                if self.buffer == self.last_external {
                    // Typing converged on the external content: the conflict
                    // has dissolved into acceptance
                    self.last_saved = self.buffer.clone();
                    self.state = SessionState::Clean;
                    effects.push(SessionEffect::CancelAutosave);
                } else if self.buffer == self.last_saved {
                    // Back to the saved content, but the external change is
                    // still outstanding; re-evaluate once the typing stops
                    self.state = SessionState::Clean;
                    self.deferred_external = true;
                    effects.push(SessionEffect::CancelAutosave);
                }
                // Otherwise the conflict stands, with a fresher local side
            }
            _ => {
                if self.buffer == self.last_saved {
                    self.state = SessionState::Clean;
                    effects.push(SessionEffect::CancelAutosave);
                } else {
                    self.state = SessionState::Dirty;
                    effects.push(SessionEffect::ScheduleAutosave);
                }
            }
        }
        effects
    }

    fn on_editing_idle(&mut self) -> Vec<SessionEffect> {
        self.user_editing = false;
        if !self.deferred_external {
            return Vec::new();
        }
        if self.state == SessionState::Saving {
            // Still can't decide anything; the save's completion will
            // re-resolve
            return Vec::new();
        }
        self.deferred_external = false;
        self.resolve_external()
    }

    /// Decides what to do about `last_external` once nothing blocks the
    /// decision (no active typing, no in-flight save).
    fn resolve_external(&mut self) -> Vec<SessionEffect> {
        if self.buffer == self.last_external {
            // Converged: adopt silently
            if self.last_saved != self.buffer {
                self.last_saved = self.buffer.clone();
            }
            self.state = SessionState::Clean;
            return Vec::new();
        }
        if !self.dirty() {
            // Clean buffer: accept the external content in place
            let content = self.last_external.clone();
            self.buffer = content.clone();
            self.last_saved = content.clone();
            self.state = SessionState::Clean;
            return vec![SessionEffect::BufferReplaced { content }];
        }
        self.state = SessionState::ConflictPending;
        vec![
            SessionEffect::CancelAutosave,
            SessionEffect::ConflictPresented {
                local: self.buffer.clone(),
                external: self.last_external.clone(),
            },
        ]
    }

    fn on_save_requested(&mut self) -> Vec<SessionEffect> {
        if self.state != SessionState::Dirty {
            // Nothing to save, a save already in flight, or a conflict that
            // has to be resolved first
            return Vec::new();
        }
        if self.pending_save.as_ref() == Some(&self.buffer) {
            // This exact content is already on its way to the disk
            return Vec::new();
        }
        self.pending_save = Some(self.buffer.clone());
        self.state = SessionState::Saving;
        vec![SessionEffect::SendSaveRequest {
            content: self.buffer.clone(),
        }]
    }

    fn on_save_completed(&mut self, content: FileContent) -> Vec<SessionEffect> {
        self.last_saved = content.clone();
        self.last_external = content;
        self.pending_save = None;
        // Whatever external change we were sitting on, our completed write
        // has since overwritten it on disk; the choice resolved itself
        self.deferred_external = false;

        if self.dirty() {
            self.state = SessionState::Dirty;
            vec![SessionEffect::ScheduleAutosave]
        } else {
            self.state = SessionState::Clean;
            Vec::new()
        }
    }

    fn on_save_failed(&mut self, message: String) -> Vec<SessionEffect> {
        debug!(path = ?self.path, %message, "save failed");
        self.pending_save = None;
        self.state = if self.dirty() {
            SessionState::Dirty
        } else {
            SessionState::Clean
        };
        // The buffer is untouched; an unsaved buffer is recoverable, a
        // discarded one isn't. If an external change queued up behind the
        // failed save, deal with it now
        if self.deferred_external && !self.user_editing {
            self.deferred_external = false;
            return self.resolve_external();
        }
        Vec::new()
    }

    fn on_resolve_conflict(&mut self, choice: ConflictChoice) -> Vec<SessionEffect> {
        if self.state != SessionState::ConflictPending {
            // Resolving twice (or without a conflict) is a no-op, which is
            // what makes accept-external idempotent
            return Vec::new();
        }
        match choice {
            ConflictChoice::KeepLocal => {
                // The buffer stands; the next save will overwrite the
                // external content on disk
                self.state = SessionState::Dirty;
                vec![SessionEffect::ScheduleAutosave]
            }
            ConflictChoice::AcceptExternal => {
                let content = self.last_external.clone();
                self.buffer = content.clone();
                self.last_saved = content.clone();
                self.state = SessionState::Clean;
                vec![
                    SessionEffect::CancelAutosave,
                    SessionEffect::BufferReplaced { content },
                ]
            }
        }
    }

    /// The invariants from the data model, checked after every transition in
    /// debug builds.
    fn debug_check_invariants(&self) {
        debug_assert!(
            self.state != SessionState::Clean || !self.dirty(),
            "clean session with a dirty buffer"
        );
        debug_assert!(
            self.state != SessionState::Saving || self.pending_save.is_some(),
            "saving without a pending save"
        );
        debug_assert!(
            self.state != SessionState::ConflictPending
                || (self.dirty() && self.buffer != self.last_external),
            "conflict without a real disagreement"
        );
    }
}
