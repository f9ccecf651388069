//! Round Synchronizer
//!
//! Advances the shared question pointer for a room: accepts one answer
//! per player per round, scores it against the answer key frozen at
//! room creation, and moves the round forward once both players have
//! answered or the round deadline passes. All entry points take the
//! room by `&mut`, so callers serialize through the room's lock.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::core::ids::UserId;
use crate::game::room::{AnswerRecord, Room, RoomError, RoomStatus};

/// Result of an answer submission, as reported back to the submitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnswerOutcome {
    /// Whether the submission was recorded. `false` means a duplicate
    /// for this (user, round): a no-op, not an error.
    pub accepted: bool,
    /// Whether the selection matched the answer key.
    pub correct: bool,
    /// Score delta applied to the submitter (0 or 1).
    pub delta: u32,
}

/// Emitted when the shared question pointer advances.
#[derive(Clone, Copy, Debug)]
pub struct RoundTransition {
    /// The round that just completed.
    pub completed_index: usize,
    /// Answer key for the completed round, now safe to reveal.
    pub correct_answer: u8,
    /// Scores after the round, primary first.
    pub scores: [u32; 2],
    /// Whether the completed round was the last one; the room has been
    /// finalized when set.
    pub match_over: bool,
}

fn has_answered(room: &Room, user_id: UserId, round_index: usize) -> bool {
    room.answers
        .iter()
        .any(|a| a.user_id == user_id && a.round_index == round_index)
}

fn both_answered(room: &Room, round_index: usize) -> bool {
    room.participants
        .iter()
        .all(|p| has_answered(room, p.user_id, round_index))
}

/// Advance the question pointer after a completed round.
///
/// Finalizes the room when the question sequence is exhausted.
fn advance(room: &mut Room, now: DateTime<Utc>) -> RoundTransition {
    let completed = room.current_round;
    let correct_answer = room.questions[completed].correct_option;

    room.current_round += 1;
    room.round_opened_at = Some(now);

    let match_over = room.current_round >= room.questions.len();
    if match_over {
        room.finalize(now);
    }

    RoundTransition {
        completed_index: completed,
        correct_answer,
        scores: room.scores,
        match_over,
    }
}

/// Submit one answer for the current round.
///
/// Typed rejections (`InvalidState`, `StaleRound`) never mutate the
/// room; a duplicate submission returns `accepted = false` and changes
/// nothing. On a correct answer the submitter's score increments and
/// the battle clock gains the per-rules bonus. Returns the round
/// transition when this submission completed the round.
pub fn submit_answer(
    room: &mut Room,
    user_id: UserId,
    round_index: usize,
    selected_option: u8,
    now: DateTime<Utc>,
) -> Result<(AnswerOutcome, Option<RoundTransition>), RoomError> {
    let index = room
        .participant_index(user_id)
        .ok_or(RoomError::NotParticipant)?;

    if room.status != RoomStatus::Playing {
        return Err(RoomError::InvalidState {
            actual: room.status,
        });
    }
    if round_index != room.current_round {
        return Err(RoomError::StaleRound {
            submitted: round_index,
            current: room.current_round,
        });
    }
    if has_answered(room, user_id, round_index) {
        // Idempotent by (user, round): at most one credit.
        debug!(
            room = %room.id.short(),
            user = %user_id.short(),
            round = round_index,
            "duplicate answer ignored"
        );
        return Ok((
            AnswerOutcome {
                accepted: false,
                correct: false,
                delta: 0,
            },
            None,
        ));
    }

    let correct = selected_option == room.questions[round_index].correct_option;
    room.answers.push(AnswerRecord {
        room_id: room.id,
        round_index,
        user_id,
        selected_option: Some(selected_option),
        correct,
        submitted_at: now,
    });

    let mut delta = 0;
    if correct {
        room.scores[index] += 1;
        delta = 1;
        if let Some(clock) = room.clock.as_mut() {
            clock.add_bonus(room.rules.correct_bonus_secs);
        }
    }

    let transition = if both_answered(room, round_index) {
        Some(advance(room, now))
    } else {
        None
    };

    Ok((
        AnswerOutcome {
            accepted: true,
            correct,
            delta,
        },
        transition,
    ))
}

/// Whether the current round's answer deadline has passed.
pub fn round_deadline_passed(room: &Room, now: DateTime<Utc>) -> bool {
    if room.status != RoomStatus::Playing {
        return false;
    }
    match room.round_opened_at {
        Some(opened) => now - opened > Duration::seconds(room.rules.round_time_secs),
        None => false,
    }
}

/// Expire the current round after its deadline.
///
/// Every participant who has not answered is recorded with the
/// no-answer sentinel (incorrect, no credit) and the round advances.
/// Returns `None` when the room is not playing or the deadline has not
/// passed.
pub fn expire_round(room: &mut Room, now: DateTime<Utc>) -> Option<RoundTransition> {
    if !round_deadline_passed(room, now) {
        return None;
    }

    let round_index = room.current_round;
    let silent: Vec<UserId> = room
        .participants
        .iter()
        .map(|p| p.user_id)
        .filter(|u| !has_answered(room, *u, round_index))
        .collect();

    for user_id in silent {
        debug!(
            room = %room.id.short(),
            user = %user_id.short(),
            round = round_index,
            "round timed out, recording no-answer"
        );
        room.answers.push(AnswerRecord {
            room_id: room.id,
            round_index,
            user_id,
            selected_option: None,
            correct: false,
            submitted_at: now,
        });
    }

    Some(advance(room, now))
}

/// Finalize the room if the battle clock has fully elapsed.
///
/// Returns whether this call performed the finalize transition; the
/// room's own terminal-state check makes repeated firings harmless.
pub fn check_clock(room: &mut Room, now: DateTime<Utc>) -> bool {
    if room.status != RoomStatus::Playing {
        return false;
    }
    match room.clock {
        Some(clock) if clock.expired(now) => room.finalize(now),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::room::tests::{make_room, user};
    use crate::game::room::RoomStatus;

    fn playing_room(n_questions: usize) -> (Room, DateTime<Utc>) {
        let mut room = make_room(n_questions);
        let now = Utc::now();
        room.confirm(user(1), now).unwrap();
        room.confirm(user(2), now).unwrap();
        (room, now)
    }

    // Answer key in make_room is i % 4 for round i.
    fn key(round: usize) -> u8 {
        (round % 4) as u8
    }

    #[test]
    fn test_correct_answer_scores_and_earns_bonus() {
        let (mut room, now) = playing_room(25);

        let (outcome, transition) = submit_answer(&mut room, user(1), 0, key(0), now).unwrap();
        assert!(outcome.accepted);
        assert!(outcome.correct);
        assert_eq!(outcome.delta, 1);
        assert!(transition.is_none());
        assert_eq!(room.scores, [1, 0]);
        assert_eq!(room.clock.unwrap().bonus_secs, 3);
    }

    #[test]
    fn test_incorrect_answer_no_penalty() {
        let (mut room, now) = playing_room(25);

        let (outcome, _) = submit_answer(&mut room, user(1), 0, key(0) + 1, now).unwrap();
        assert!(outcome.accepted);
        assert!(!outcome.correct);
        assert_eq!(outcome.delta, 0);
        assert_eq!(room.scores, [0, 0]);
        assert_eq!(room.clock.unwrap().bonus_secs, 0);
    }

    #[test]
    fn test_duplicate_submission_at_most_one_credit() {
        let (mut room, now) = playing_room(25);

        submit_answer(&mut room, user(1), 0, key(0), now).unwrap();
        let (outcome, _) = submit_answer(&mut room, user(1), 0, key(0), now).unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.delta, 0);
        assert_eq!(room.scores, [1, 0]);
        assert_eq!(room.answers.len(), 1);
    }

    #[test]
    fn test_stale_round_rejected() {
        let (mut room, now) = playing_room(25);
        submit_answer(&mut room, user(1), 0, key(0), now).unwrap();
        submit_answer(&mut room, user(2), 0, key(0), now).unwrap();
        assert_eq!(room.current_round, 1);

        let err = submit_answer(&mut room, user(1), 0, key(0), now).unwrap_err();
        assert_eq!(
            err,
            RoomError::StaleRound {
                submitted: 0,
                current: 1
            }
        );
    }

    #[test]
    fn test_answer_outside_playing_rejected() {
        let mut room = make_room(25);
        let err = submit_answer(&mut room, user(1), 0, 0, Utc::now()).unwrap_err();
        assert!(matches!(err, RoomError::InvalidState { .. }));
    }

    #[test]
    fn test_round_advances_when_both_answer() {
        let (mut room, now) = playing_room(25);

        submit_answer(&mut room, user(1), 0, key(0), now).unwrap();
        let (_, transition) = submit_answer(&mut room, user(2), 0, key(0) + 1, now).unwrap();

        let t = transition.unwrap();
        assert_eq!(t.completed_index, 0);
        assert_eq!(t.correct_answer, key(0));
        assert_eq!(t.scores, [1, 0]);
        assert!(!t.match_over);
        assert_eq!(room.current_round, 1);
    }

    #[test]
    fn test_round_timeout_records_no_answer_and_advances() {
        let (mut room, now) = playing_room(25);
        submit_answer(&mut room, user(1), 0, key(0), now).unwrap();

        // Deadline not passed yet.
        assert!(expire_round(&mut room, now).is_none());

        let late = now + Duration::seconds(31);
        let t = expire_round(&mut room, late).unwrap();
        assert_eq!(t.completed_index, 0);
        assert_eq!(room.current_round, 1);

        // Silent player recorded with the sentinel.
        let record = room
            .answers
            .iter()
            .find(|a| a.user_id == user(2) && a.round_index == 0)
            .unwrap();
        assert_eq!(record.selected_option, None);
        assert!(!record.correct);
    }

    #[test]
    fn test_exhausting_rounds_finalizes() {
        let (mut room, now) = playing_room(3);

        for round in 0..3 {
            submit_answer(&mut room, user(1), round, key(round), now).unwrap();
            let (_, transition) = submit_answer(&mut room, user(2), round, 3, now).unwrap();
            let t = transition.unwrap();
            assert_eq!(t.match_over, round == 2);
        }

        assert_eq!(room.status, RoomStatus::Finished);
        assert_eq!(room.winner_id, Some(user(1)));
    }

    #[test]
    fn test_clock_expiry_finalizes_once() {
        let (mut room, now) = playing_room(25);
        submit_answer(&mut room, user(1), 0, key(0), now).unwrap();

        let not_yet = now + Duration::seconds(100);
        assert!(!check_clock(&mut room, not_yet));
        assert_eq!(room.status, RoomStatus::Playing);

        // One correct answer pushed the deadline to 303s.
        let past = now + Duration::seconds(304);
        assert!(check_clock(&mut room, past));
        assert_eq!(room.status, RoomStatus::Finished);
        assert_eq!(room.winner_id, Some(user(1)));

        // Another timer firing after finalize is a no-op.
        assert!(!check_clock(&mut room, past));
    }

    #[test]
    fn test_random_play_scores_match_correct_count() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let (mut room, now) = playing_room(25);

        let mut expected = [0u32; 2];
        for round in 0..25 {
            for (index, player) in [user(1), user(2)].into_iter().enumerate() {
                let choice: u8 = rng.gen_range(0..4);
                let (outcome, _) = submit_answer(&mut room, player, round, choice, now).unwrap();
                assert_eq!(outcome.correct, choice == key(round));
                if outcome.correct {
                    expected[index] += 1;
                }
            }
        }

        assert_eq!(room.scores, expected);
        assert_eq!(room.status, RoomStatus::Finished);
        // Every correct answer added its bonus to the clock.
        let total_correct = (expected[0] + expected[1]) as i64;
        assert_eq!(room.clock.unwrap().bonus_secs, total_correct * 3);
    }

    #[test]
    fn test_full_disconnect_still_completes() {
        // One participant never answers anything: every round expires,
        // the match still finishes with a deterministic outcome.
        let (mut room, start) = playing_room(3);
        let mut now = start;

        for round in 0..3 {
            submit_answer(&mut room, user(1), round, key(round), now).unwrap();
            now += Duration::seconds(31);
            let t = expire_round(&mut room, now).unwrap();
            assert_eq!(t.completed_index, round);
        }

        assert_eq!(room.status, RoomStatus::Finished);
        assert_eq!(room.scores, [3, 0]);
        assert_eq!(room.winner_id, Some(user(1)));
        // Three sentinel records for the silent player.
        let sentinels = room
            .answers
            .iter()
            .filter(|a| a.user_id == user(2) && a.selected_option.is_none())
            .count();
        assert_eq!(sentinels, 3);
    }
}
