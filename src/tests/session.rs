use crate::content::FileContent;
use crate::session::*;

fn content(text: &str) -> FileContent {
    FileContent::new(text)
}

/// Builds a session that has loaded the given initial content.
fn loaded_session(initial: &str) -> EditSession {
    let mut session = EditSession::new("/doc.md");
    let effects = session.apply(SessionEvent::HostUpdate {
        content: content(initial),
    });
    assert_eq!(session.state(), SessionState::Clean);
    assert!(effects.contains(&SessionEffect::BufferReplaced {
        content: content(initial)
    }));
    session
}

#[test]
fn should_load_initial_content() {
    let session = loaded_session("hello");
    assert_eq!(session.buffer(), &content("hello"));
    assert_eq!(session.last_saved(), &content("hello"));
    assert_eq!(session.last_external(), &content("hello"));
    assert!(!session.dirty());
}

#[test]
fn should_stay_initializing_on_load_failure() {
    let mut session = EditSession::new("/doc.md");
    let effects = session.apply(SessionEvent::LoadFailed {
        message: "too large".to_string(),
    });
    assert!(effects.is_empty());
    assert_eq!(session.state(), SessionState::Initializing);

    // A later successful update still rescues the session
    session.apply(SessionEvent::HostUpdate {
        content: content("eventually"),
    });
    assert_eq!(session.state(), SessionState::Clean);
}

#[test]
fn should_ignore_edits_before_load() {
    let mut session = EditSession::new("/doc.md");
    let effects = session.apply(SessionEvent::UserEdit {
        content: content("premature"),
    });
    assert!(effects.is_empty());
    assert_eq!(session.state(), SessionState::Initializing);
    assert!(session.buffer().is_empty());
}

#[test]
fn should_complete_happy_save_round_trip() {
    let mut session = loaded_session("hello");

    let effects = session.apply(SessionEvent::UserEdit {
        content: content("hello!"),
    });
    assert_eq!(session.state(), SessionState::Dirty);
    assert!(session.dirty());
    assert!(effects.contains(&SessionEffect::ScheduleAutosave));
    assert!(effects.contains(&SessionEffect::StartEditingIdle));

    let effects = session.apply(SessionEvent::SaveRequested);
    assert_eq!(session.state(), SessionState::Saving);
    assert_eq!(
        effects,
        vec![SessionEffect::SendSaveRequest {
            content: content("hello!")
        }]
    );

    let effects = session.apply(SessionEvent::SaveCompleted {
        content: content("hello!"),
    });
    assert!(effects.is_empty());
    assert_eq!(session.state(), SessionState::Clean);
    assert_eq!(session.buffer(), &content("hello!"));
    assert_eq!(session.last_saved(), &content("hello!"));
    assert_eq!(session.last_external(), &content("hello!"));
    assert!(!session.dirty());
}

#[test]
fn should_not_clobber_buffer_on_echo() {
    let mut session = loaded_session("hello");
    session.apply(SessionEvent::UserEdit {
        content: content("hello!"),
    });
    session.apply(SessionEvent::SaveRequested);

    // The user keeps typing while the save is in flight
    session.apply(SessionEvent::UserEdit {
        content: content("hello!?"),
    });
    assert_eq!(session.state(), SessionState::Saving);
    assert_eq!(session.buffer(), &content("hello!?"));

    // The echo of our own write comes back through the change pipeline; it
    // must only move the reference contents, never the buffer
    let effects = session.apply(SessionEvent::HostUpdate {
        content: content("hello!"),
    });
    assert!(effects.is_empty());
    assert_eq!(session.buffer(), &content("hello!?"));
    assert_eq!(session.last_saved(), &content("hello!"));
    assert_eq!(session.last_external(), &content("hello!"));
    assert!(session.dirty());

    // Completion lands us in dirty (the buffer moved on) with a fresh
    // autosave on the way
    let effects = session.apply(SessionEvent::SaveCompleted {
        content: content("hello!"),
    });
    assert_eq!(session.state(), SessionState::Dirty);
    assert_eq!(effects, vec![SessionEffect::ScheduleAutosave]);
    assert_eq!(session.buffer(), &content("hello!?"));
}

#[test]
fn should_present_conflict_for_external_change_with_unsaved_edits() {
    let mut session = loaded_session("a");
    session.apply(SessionEvent::UserEdit {
        content: content("abc"),
    });
    // The user stopped typing a while ago
    session.apply(SessionEvent::EditingIdle);
    assert!(!session.is_user_editing());

    let effects = session.apply(SessionEvent::HostUpdate {
        content: content("xyz"),
    });
    assert_eq!(session.state(), SessionState::ConflictPending);
    assert!(effects.contains(&SessionEffect::ConflictPresented {
        local: content("abc"),
        external: content("xyz"),
    }));
    assert!(effects.contains(&SessionEffect::CancelAutosave));
    assert!(session.dirty());
}

#[test]
fn should_accept_external_on_resolution() {
    let mut session = loaded_session("a");
    session.apply(SessionEvent::UserEdit {
        content: content("abc"),
    });
    session.apply(SessionEvent::EditingIdle);
    session.apply(SessionEvent::HostUpdate {
        content: content("xyz"),
    });

    let effects = session.apply(SessionEvent::ResolveConflict(ConflictChoice::AcceptExternal));
    assert_eq!(session.state(), SessionState::Clean);
    assert_eq!(session.buffer(), &content("xyz"));
    assert_eq!(session.last_saved(), &content("xyz"));
    assert_eq!(session.last_external(), &content("xyz"));
    assert!(effects.contains(&SessionEffect::BufferReplaced {
        content: content("xyz")
    }));

    // Resolving again changes nothing: accept-external is idempotent
    let effects = session.apply(SessionEvent::ResolveConflict(ConflictChoice::AcceptExternal));
    assert!(effects.is_empty());
    assert_eq!(session.state(), SessionState::Clean);
    assert_eq!(session.buffer(), &content("xyz"));
}

#[test]
fn should_keep_local_on_resolution_and_suppress_echo_of_rescue_save() {
    let mut session = loaded_session("a");
    session.apply(SessionEvent::UserEdit {
        content: content("abc"),
    });
    session.apply(SessionEvent::EditingIdle);
    session.apply(SessionEvent::HostUpdate {
        content: content("xyz"),
    });

    let effects = session.apply(SessionEvent::ResolveConflict(ConflictChoice::KeepLocal));
    assert_eq!(session.state(), SessionState::Dirty);
    assert_eq!(session.buffer(), &content("abc"));
    assert_eq!(session.last_external(), &content("xyz"));
    assert_eq!(effects, vec![SessionEffect::ScheduleAutosave]);

    // The rescue save goes out, and its echo must not re-trigger anything
    session.apply(SessionEvent::SaveRequested);
    let effects = session.apply(SessionEvent::HostUpdate {
        content: content("abc"),
    });
    assert!(effects.is_empty());
    session.apply(SessionEvent::SaveCompleted {
        content: content("abc"),
    });
    assert_eq!(session.state(), SessionState::Clean);
    assert_eq!(session.buffer(), &content("abc"));
}

#[test]
fn should_defer_external_change_while_editing() {
    let mut session = loaded_session("a");
    let effects = session.apply(SessionEvent::UserEdit {
        content: content("ab"),
    });
    assert!(effects.contains(&SessionEffect::StartEditingIdle));
    assert!(session.is_user_editing());

    // An external change lands mid-typing: no conflict yet
    let effects = session.apply(SessionEvent::HostUpdate {
        content: content("xyz"),
    });
    assert!(effects.is_empty());
    assert_eq!(session.state(), SessionState::Dirty);
    assert_eq!(session.buffer(), &content("ab"));
    assert_eq!(session.last_external(), &content("xyz"));

    // Once the typing stops, the deferred change surfaces
    let effects = session.apply(SessionEvent::EditingIdle);
    assert_eq!(session.state(), SessionState::ConflictPending);
    assert!(effects.contains(&SessionEffect::ConflictPresented {
        local: content("ab"),
        external: content("xyz"),
    }));
}

#[test]
fn should_accept_external_in_place_when_clean() {
    let mut session = loaded_session("one");
    session.apply(SessionEvent::EditingIdle);

    let effects = session.apply(SessionEvent::HostUpdate {
        content: content("two"),
    });
    assert_eq!(session.state(), SessionState::Clean);
    assert_eq!(session.buffer(), &content("two"));
    assert_eq!(session.last_saved(), &content("two"));
    assert_eq!(
        effects,
        vec![SessionEffect::BufferReplaced {
            content: content("two")
        }]
    );
}

#[test]
fn should_adopt_external_silently_when_buffer_already_matches() {
    let mut session = loaded_session("a");
    session.apply(SessionEvent::UserEdit {
        content: content("xyz"),
    });
    session.apply(SessionEvent::EditingIdle);

    // The user happened to type exactly what appeared on disk
    let effects = session.apply(SessionEvent::HostUpdate {
        content: content("xyz"),
    });
    assert_eq!(session.state(), SessionState::Clean);
    assert!(!session.dirty());
    assert!(effects.contains(&SessionEffect::CancelAutosave));
    assert!(!effects
        .iter()
        .any(|effect| matches!(effect, SessionEffect::ConflictPresented { .. })));
}

#[test]
fn should_return_to_clean_when_edit_restores_saved_content() {
    let mut session = loaded_session("same");
    session.apply(SessionEvent::UserEdit {
        content: content("changed"),
    });
    assert_eq!(session.state(), SessionState::Dirty);

    let effects = session.apply(SessionEvent::UserEdit {
        content: content("same"),
    });
    assert_eq!(session.state(), SessionState::Clean);
    assert!(!session.dirty());
    assert!(effects.contains(&SessionEffect::CancelAutosave));
}

#[test]
fn should_stay_dirty_with_buffer_intact_on_save_failure() {
    let mut session = loaded_session("data");
    session.apply(SessionEvent::UserEdit {
        content: content("data v2"),
    });
    session.apply(SessionEvent::SaveRequested);

    let effects = session.apply(SessionEvent::SaveFailed {
        message: "disk full".to_string(),
    });
    assert!(effects.is_empty());
    assert_eq!(session.state(), SessionState::Dirty);
    assert_eq!(session.buffer(), &content("data v2"));
    assert!(session.dirty());

    // A retry is still possible
    let effects = session.apply(SessionEvent::SaveRequested);
    assert_eq!(
        effects,
        vec![SessionEffect::SendSaveRequest {
            content: content("data v2")
        }]
    );
}

#[test]
fn should_skip_save_for_content_already_in_flight() {
    let mut session = loaded_session("x");
    session.apply(SessionEvent::UserEdit {
        content: content("xx"),
    });
    session.apply(SessionEvent::SaveRequested);
    assert_eq!(session.state(), SessionState::Saving);

    // A second request while saving is a no-op
    let effects = session.apply(SessionEvent::SaveRequested);
    assert!(effects.is_empty());
    assert_eq!(session.state(), SessionState::Saving);
}

#[test]
fn should_defer_external_during_save_and_let_completion_win() {
    let mut session = loaded_session("base");
    session.apply(SessionEvent::UserEdit {
        content: content("ours"),
    });
    session.apply(SessionEvent::EditingIdle);
    session.apply(SessionEvent::SaveRequested);

    // External content appears while our write is in flight; our write will
    // land after it and overwrite it on disk
    let effects = session.apply(SessionEvent::HostUpdate {
        content: content("theirs"),
    });
    assert!(effects.is_empty());
    assert_eq!(session.state(), SessionState::Saving);

    session.apply(SessionEvent::SaveCompleted {
        content: content("ours"),
    });
    assert_eq!(session.state(), SessionState::Clean);
    assert_eq!(session.buffer(), &content("ours"));
    assert_eq!(session.last_external(), &content("ours"));
}

#[test]
fn should_hold_dirty_invariant_across_transitions() {
    let mut session = loaded_session("0");
    let events = vec![
        SessionEvent::UserEdit {
            content: content("1"),
        },
        SessionEvent::SaveRequested,
        SessionEvent::UserEdit {
            content: content("2"),
        },
        SessionEvent::HostUpdate {
            content: content("1"),
        },
        SessionEvent::SaveCompleted {
            content: content("1"),
        },
        SessionEvent::EditingIdle,
        SessionEvent::SaveRequested,
        SessionEvent::SaveCompleted {
            content: content("2"),
        },
    ];
    for event in events {
        session.apply(event);
        // Dirty must mean exactly "buffer differs from last saved" after
        // every single transition
        assert_eq!(session.dirty(), session.buffer() != session.last_saved());
        if session.state() == SessionState::ConflictPending {
            assert!(session.dirty());
        }
    }
    assert_eq!(session.state(), SessionState::Clean);
    assert_eq!(session.buffer(), &content("2"));
}

#[test]
fn should_ignore_duplicate_external_notification() {
    let mut session = loaded_session("a");
    session.apply(SessionEvent::UserEdit {
        content: content("ab"),
    });
    session.apply(SessionEvent::EditingIdle);
    session.apply(SessionEvent::HostUpdate {
        content: content("xyz"),
    });
    assert_eq!(session.state(), SessionState::ConflictPending);

    // The same external content reported again carries no new information
    let effects = session.apply(SessionEvent::HostUpdate {
        content: content("xyz"),
    });
    assert!(effects.is_empty());
    assert_eq!(session.state(), SessionState::ConflictPending);
}

#[test]
fn should_cancel_autosave_on_close() {
    let mut session = loaded_session("a");
    session.apply(SessionEvent::UserEdit {
        content: content("ab"),
    });
    let effects = session.apply(SessionEvent::Close);
    assert!(effects.contains(&SessionEffect::CancelAutosave));
}
