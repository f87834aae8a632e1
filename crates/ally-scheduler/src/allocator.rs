//! Allocator: maps topics and availability onto a list of study sessions.
//!
//! Pure: reads its inputs, returns a candidate plan, mutates nothing.
//!
//! ```text
//! topics ──► urgency score ──► chunks ──► sort (urgency ↓, deadline ↑, seq ↑)
//!                                              │
//! availability ──► day pieces (after now) ─────┴──► greedy earliest fit
//!                                                    (daily cap, min gap)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ally_core::config::PlannerConfig;
use ally_core::error::{AllyError, Result};
use ally_core::types::{AvailabilitySlot, Chunk, Session, SessionStatus, Topic};
use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Inputs for one allocation run.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest<'a> {
    /// Topics to place. `remaining_minutes` is the effort still to be placed.
    pub topics: &'a [Topic],
    pub availability: &'a [AvailabilitySlot],
    /// Sessions that stay where they are. They block time, count toward the
    /// daily cap, and their missed history feeds the urgency boost.
    pub fixed: &'a [Session],
    pub now: DateTime<Utc>,
    /// Nothing is placed at or after this instant.
    pub horizon_end: Option<DateTime<Utc>>,
}

/// Candidate plan produced by [`allocate`].
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    /// New sessions, ordered by start time.
    pub sessions: Vec<Session>,
    /// Every chunk produced, placed or not.
    pub chunks: Vec<Chunk>,
    /// Chunks no slot could take.
    pub unplaced: Vec<Chunk>,
    /// Topics with a chunk past their deadline or left unplaced.
    pub at_risk: BTreeSet<String>,
}

impl Allocation {
    pub fn planned_minutes(&self) -> i64 {
        self.sessions.iter().map(Session::minutes).sum()
    }
}

/// Urgency of a topic at `now`. Missed sessions boost the effective weight.
pub fn urgency_score(
    topic: &Topic,
    missed: u32,
    now: DateTime<Utc>,
    policy: &PlannerConfig,
) -> f64 {
    let weight = topic.weight * (1.0 + policy.missed_weight_boost * missed as f64);
    match topic.deadline {
        Some(deadline) => {
            let minutes_left = (deadline - now)
                .num_minutes()
                .max(policy.urgency_epsilon_minutes);
            let hours_left = minutes_left as f64 / 60.0;
            weight * (policy.urgency_horizon_hours as f64 / hours_left)
        }
        None => weight,
    }
}

/// Chunk length for a topic. Shrinks toward `min_chunk_minutes` as the
/// deadline gets closer than `near_deadline_hours`.
pub fn chunk_minutes(topic: &Topic, now: DateTime<Utc>, policy: &PlannerConfig) -> i64 {
    let base = topic
        .chunk_minutes
        .unwrap_or(policy.max_chunk_minutes)
        .min(policy.max_chunk_minutes)
        .max(1);

    let Some(deadline) = topic.deadline else {
        return base;
    };
    let near = policy.near_deadline_hours * 60;
    let left = (deadline - now).num_minutes().max(0);
    if near <= 0 || left >= near {
        return base;
    }
    let scaled = base * left / near;
    scaled.max(policy.min_chunk_minutes).min(base)
}

/// Split a topic's remaining effort into chunks of at most `size` minutes.
/// The chunk minutes always sum to `remaining_minutes`.
pub fn split_into_chunks(topic: &Topic, size: i64) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut left = topic.remaining_minutes;
    let mut index = 0u32;
    while left > 0 {
        let minutes = left.min(size);
        chunks.push(Chunk {
            topic_id: topic.id.clone(),
            index,
            minutes,
        });
        left -= minutes;
        index += 1;
    }
    chunks
}

/// A part of an availability slot that lies within one UTC day and after `now`.
#[derive(Debug, Clone, Copy)]
struct Piece {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    day: NaiveDate,
}

fn start_of_next_day(t: DateTime<Utc>) -> DateTime<Utc> {
    let next = t.date_naive() + Duration::days(1);
    next.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(t + Duration::days(1))
}

fn day_pieces(
    slots: &[AvailabilitySlot],
    now: DateTime<Utc>,
    horizon_end: Option<DateTime<Utc>>,
) -> Vec<Piece> {
    let mut pieces = Vec::new();
    for slot in slots {
        let start = slot.start.max(now);
        let end = match horizon_end {
            Some(h) => slot.end.min(h),
            None => slot.end,
        };
        let mut cursor = start;
        while cursor < end {
            let piece_end = start_of_next_day(cursor).min(end);
            pieces.push(Piece {
                start: cursor,
                end: piece_end,
                day: cursor.date_naive(),
            });
            cursor = piece_end;
        }
    }
    pieces.sort_by_key(|p| p.start);
    pieces
}

fn overlap_minutes(a: (DateTime<Utc>, DateTime<Utc>), b: (DateTime<Utc>, DateTime<Utc>)) -> i64 {
    let start = a.0.max(b.0);
    let end = a.1.min(b.1);
    if start < end {
        (end - start).num_minutes()
    } else {
        0
    }
}

/// Free study minutes after `now`, per day, net of fixed sessions and the daily cap.
fn available_minutes(
    pieces: &[Piece],
    occupied: &[(DateTime<Utc>, DateTime<Utc>)],
    used: &BTreeMap<NaiveDate, i64>,
    policy: &PlannerConfig,
) -> i64 {
    let mut free_by_day: BTreeMap<NaiveDate, i64> = BTreeMap::new();
    for piece in pieces {
        let blocked: i64 = occupied
            .iter()
            .map(|o| overlap_minutes((piece.start, piece.end), *o))
            .sum();
        let free = ((piece.end - piece.start).num_minutes() - blocked).max(0);
        *free_by_day.entry(piece.day).or_default() += free;
    }
    free_by_day
        .into_iter()
        .map(|(day, free)| {
            let cap_left = (policy.daily_cap_minutes - used.get(&day).copied().unwrap_or(0)).max(0);
            free.min(cap_left)
        })
        .sum()
}

/// Earliest start within `piece` for a chunk of `minutes`, keeping `gap`
/// minutes clear of every occupied interval.
fn earliest_fit(
    piece: &Piece,
    minutes: i64,
    gap: Duration,
    occupied: &[(DateTime<Utc>, DateTime<Utc>)],
) -> Option<DateTime<Utc>> {
    let length = Duration::minutes(minutes);
    let mut candidates: Vec<DateTime<Utc>> = std::iter::once(piece.start)
        .chain(
            occupied
                .iter()
                .map(|(_, end)| *end + gap)
                .filter(|t| *t > piece.start && *t < piece.end),
        )
        .collect();
    candidates.sort();

    candidates.into_iter().find(|&start| {
        let end = start + length;
        end <= piece.end
            && occupied
                .iter()
                .all(|&(o_start, o_end)| start >= o_end + gap || end + gap <= o_start)
    })
}

/// Allocate the requested topics into the available time.
///
/// Fails with `InfeasibleConstraints` only when the total effort exceeds the
/// free capacity by more than `overflow_tolerance`. Otherwise chunks that do
/// not fit are reported in [`Allocation::unplaced`] and their topic is at risk.
pub fn allocate(request: &AllocationRequest<'_>, policy: &PlannerConfig) -> Result<Allocation> {
    let now = request.now;
    let topics: Vec<&Topic> = request
        .topics
        .iter()
        .filter(|t| t.remaining_minutes > 0)
        .collect();

    let required: i64 = topics.iter().map(|t| t.remaining_minutes).sum();
    if required == 0 {
        return Ok(Allocation::default());
    }

    let mut occupied: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    let mut used: BTreeMap<NaiveDate, i64> = BTreeMap::new();
    let mut missed: HashMap<&str, u32> = HashMap::new();
    for session in request.fixed {
        if session.status == SessionStatus::Missed {
            *missed.entry(session.topic_id.as_str()).or_default() += 1;
            continue;
        }
        *used.entry(session.start.date_naive()).or_default() += session.minutes();
        if session.end > now {
            occupied.push((session.start, session.end));
        }
    }

    let pieces = day_pieces(request.availability, now, request.horizon_end);
    let available = available_minutes(&pieces, &occupied, &used, policy);
    if required as f64 > available as f64 * (1.0 + policy.overflow_tolerance) {
        tracing::warn!(
            "🚫 Allocation infeasible: {} min requested, {} min available",
            required,
            available
        );
        return Err(AllyError::InfeasibleConstraints {
            required_minutes: required,
            available_minutes: available,
        });
    }

    // Chunk every topic and rank the chunks.
    struct Ranked<'t> {
        topic: &'t Topic,
        chunk: Chunk,
        urgency: f64,
    }
    let mut ranked: Vec<Ranked<'_>> = Vec::new();
    for &topic in &topics {
        let urgency = urgency_score(
            topic,
            missed.get(topic.id.as_str()).copied().unwrap_or(0),
            now,
            policy,
        );
        let size = chunk_minutes(topic, now, policy);
        for chunk in split_into_chunks(topic, size) {
            ranked.push(Ranked {
                topic,
                chunk,
                urgency,
            });
        }
    }
    ranked.sort_by(|a, b| {
        b.urgency
            .total_cmp(&a.urgency)
            .then_with(|| match (a.topic.deadline, b.topic.deadline) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.topic.seq.cmp(&b.topic.seq))
            .then_with(|| a.chunk.index.cmp(&b.chunk.index))
    });

    let gap = Duration::minutes(policy.min_gap_minutes);
    let mut allocation = Allocation::default();
    for Ranked { topic, chunk, .. } in ranked {
        let placed = pieces.iter().find_map(|piece| {
            let day_used = used.get(&piece.day).copied().unwrap_or(0);
            if day_used + chunk.minutes > policy.daily_cap_minutes {
                return None;
            }
            earliest_fit(piece, chunk.minutes, gap, &occupied).map(|start| (piece.day, start))
        });

        match placed {
            Some((day, start)) => {
                let session = Session::new(topic, &chunk, start);
                if topic.deadline.is_some_and(|d| session.end > d) {
                    allocation.at_risk.insert(topic.id.clone());
                }
                *used.entry(day).or_default() += chunk.minutes;
                occupied.push((session.start, session.end));
                allocation.sessions.push(session);
            }
            None => {
                allocation.at_risk.insert(topic.id.clone());
                allocation.unplaced.push(chunk.clone());
            }
        }
        allocation.chunks.push(chunk);
    }

    allocation.sessions.sort_by_key(|s| s.start);
    tracing::debug!(
        "🧮 Allocated {} sessions ({} min), {} unplaced, {} topics at risk",
        allocation.sessions.len(),
        allocation.planned_minutes(),
        allocation.unplaced.len(),
        allocation.at_risk.len()
    );
    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn monday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    /// `hours` of availability from 18:00 on each of `days` days.
    fn evenings(days: i64, hours: i64) -> Vec<AvailabilitySlot> {
        (0..days)
            .map(|d| {
                let start = monday() + Duration::days(d) + Duration::hours(10);
                AvailabilitySlot::new(start, start + Duration::hours(hours))
            })
            .collect()
    }

    fn topic(subject: &str, effort: i64, seq: u64) -> Topic {
        let mut t = Topic::new(subject, effort, 1.0, monday());
        t.seq = seq;
        t
    }

    fn no_overlap(sessions: &[Session]) -> bool {
        sessions.iter().enumerate().all(|(i, a)| {
            sessions
                .iter()
                .skip(i + 1)
                .all(|b| !a.overlaps(b.start, b.end))
        })
    }

    #[test]
    fn test_chunk_sum_equals_remaining_effort() {
        let policy = PlannerConfig::default();
        for effort in [1, 25, 49, 50, 51, 137, 360] {
            let t = topic("OS", effort, 0);
            let chunks = split_into_chunks(&t, chunk_minutes(&t, monday(), &policy));
            assert_eq!(chunks.iter().map(|c| c.minutes).sum::<i64>(), effort);
            assert!(chunks.iter().all(|c| c.minutes <= policy.max_chunk_minutes));
        }
    }

    #[test]
    fn test_chunks_shrink_near_deadline() {
        let policy = PlannerConfig::default();
        let far = topic("OS", 300, 0).with_deadline(monday() + Duration::days(10));
        let near = topic("OS", 300, 0).with_deadline(monday() + Duration::hours(12));
        assert_eq!(chunk_minutes(&far, monday(), &policy), 50);
        let small = chunk_minutes(&near, monday(), &policy);
        assert!(small < 50);
        assert!(small >= policy.min_chunk_minutes);
    }

    #[test]
    fn test_fixed_chunk_size_is_capped() {
        let policy = PlannerConfig::default();
        let t = topic("OS", 300, 0).with_chunk_minutes(120);
        assert_eq!(chunk_minutes(&t, monday(), &policy), policy.max_chunk_minutes);
        let t = topic("OS", 300, 0).with_chunk_minutes(30);
        assert_eq!(chunk_minutes(&t, monday(), &policy), 30);
    }

    #[test]
    fn test_deadline_outranks_undated_topic() {
        let policy = PlannerConfig::default();
        let os = topic("OS", 360, 0).with_deadline(monday() + Duration::days(3));
        let dbms = topic("DBMS", 240, 1);
        let undated = urgency_score(&dbms, 0, monday(), &policy);
        assert!(urgency_score(&os, 0, monday(), &policy) > undated);
        // Missed sessions raise urgency.
        assert!(urgency_score(&dbms, 2, monday(), &policy) > undated);
    }

    #[test]
    fn test_os_before_dbms_scenario() {
        let policy = PlannerConfig::default();
        let os = topic("OS", 360, 0).with_deadline(monday() + Duration::days(3));
        let dbms = topic("DBMS", 240, 1);
        let topics = vec![os.clone(), dbms.clone()];
        let slots = evenings(5, 2);

        let allocation = allocate(
            &AllocationRequest {
                topics: &topics,
                availability: &slots,
                fixed: &[],
                now: monday(),
                horizon_end: None,
            },
            &policy,
        )
        .expect("feasible");

        let first_three_days_end = monday() + Duration::days(3);
        assert!(
            allocation
                .sessions
                .iter()
                .filter(|s| s.start < first_three_days_end)
                .all(|s| s.topic_id == os.id)
        );
        let last_os = allocation
            .sessions
            .iter()
            .filter(|s| s.topic_id == os.id)
            .map(|s| s.start)
            .max()
            .unwrap();
        let first_dbms = allocation
            .sessions
            .iter()
            .filter(|s| s.topic_id == dbms.id)
            .map(|s| s.start)
            .min()
            .unwrap();
        assert!(last_os < first_dbms);
        assert!(allocation.planned_minutes() <= 600);
        assert!(no_overlap(&allocation.sessions));

        for t in &topics {
            let sum: i64 = allocation
                .chunks
                .iter()
                .filter(|c| c.topic_id == t.id)
                .map(|c| c.minutes)
                .sum();
            assert_eq!(sum, t.remaining_minutes);
        }
    }

    #[test]
    fn test_sessions_stay_inside_slots_and_respect_gap() {
        let policy = PlannerConfig::default();
        let topics = vec![topic("Math", 200, 0)];
        let slots = evenings(3, 2);
        let allocation = allocate(
            &AllocationRequest {
                topics: &topics,
                availability: &slots,
                fixed: &[],
                now: monday(),
                horizon_end: None,
            },
            &policy,
        )
        .unwrap();

        for s in &allocation.sessions {
            assert!(slots.iter().any(|slot| slot.contains(s.start, s.end)));
        }
        let mut sorted = allocation.sessions.clone();
        sorted.sort_by_key(|s| s.start);
        for pair in sorted.windows(2) {
            if pair[0].start.date_naive() == pair[1].start.date_naive() {
                assert!(pair[1].start - pair[0].end >= Duration::minutes(policy.min_gap_minutes));
            }
        }
    }

    #[test]
    fn test_daily_cap_is_honoured() {
        let policy = PlannerConfig {
            daily_cap_minutes: 60,
            max_chunk_minutes: 30,
            min_gap_minutes: 0,
            ..PlannerConfig::default()
        };
        let topics = vec![topic("History", 180, 0)];
        let slots = evenings(3, 4);
        let allocation = allocate(
            &AllocationRequest {
                topics: &topics,
                availability: &slots,
                fixed: &[],
                now: monday(),
                horizon_end: None,
            },
            &policy,
        )
        .unwrap();

        let mut per_day: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        for s in &allocation.sessions {
            *per_day.entry(s.start.date_naive()).or_default() += s.minutes();
        }
        assert!(per_day.values().all(|m| *m <= 60));
        assert_eq!(allocation.planned_minutes(), 180);
    }

    #[test]
    fn test_fixed_sessions_block_time() {
        let policy = PlannerConfig {
            min_gap_minutes: 0,
            ..PlannerConfig::default()
        };
        let slots = evenings(1, 2);
        let existing_topic = topic("Physics", 60, 0);
        let fixed = vec![Session::new(
            &existing_topic,
            &Chunk {
                topic_id: existing_topic.id.clone(),
                index: 0,
                minutes: 60,
            },
            slots[0].start,
        )];
        let topics = vec![topic("Chemistry", 60, 1)];
        let allocation = allocate(
            &AllocationRequest {
                topics: &topics,
                availability: &slots,
                fixed: &fixed,
                now: monday(),
                horizon_end: None,
            },
            &policy,
        )
        .unwrap();
        assert_eq!(allocation.sessions.len(), 2);
        assert!(allocation.sessions.iter().all(|s| s.start >= fixed[0].end));
    }

    #[test]
    fn test_infeasible_beyond_tolerance() {
        let policy = PlannerConfig::default();
        let topics = vec![topic("OS", 600, 0)];
        let slots = evenings(2, 2);
        let err = allocate(
            &AllocationRequest {
                topics: &topics,
                availability: &slots,
                fixed: &[],
                now: monday(),
                horizon_end: None,
            },
            &policy,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AllyError::InfeasibleConstraints {
                required_minutes: 600,
                available_minutes: 240
            }
        ));
    }

    #[test]
    fn test_within_tolerance_marks_at_risk_instead_of_failing() {
        let policy = PlannerConfig {
            overflow_tolerance: 0.5,
            ..PlannerConfig::default()
        };
        let t = topic("OS", 150, 0).with_deadline(monday() + Duration::days(1));
        let topics = vec![t.clone()];
        let slots = evenings(1, 2);
        let allocation = allocate(
            &AllocationRequest {
                topics: &topics,
                availability: &slots,
                fixed: &[],
                now: monday(),
                horizon_end: None,
            },
            &policy,
        )
        .unwrap();
        assert!(allocation.at_risk.contains(&t.id));
        assert!(!allocation.unplaced.is_empty());
    }

    #[test]
    fn test_past_deadline_placement_is_at_risk() {
        let policy = PlannerConfig::default();
        // Deadline before the only slot.
        let t = topic("OS", 50, 0).with_deadline(monday() + Duration::hours(2));
        let topics = vec![t.clone()];
        let slots = evenings(1, 2);
        let allocation = allocate(
            &AllocationRequest {
                topics: &topics,
                availability: &slots,
                fixed: &[],
                now: monday(),
                horizon_end: None,
            },
            &policy,
        )
        .unwrap();
        assert_eq!(allocation.sessions.len(), 1);
        assert!(allocation.at_risk.contains(&t.id));
    }

    #[test]
    fn test_horizon_limits_placement() {
        let policy = PlannerConfig::default();
        let topics = vec![topic("OS", 100, 0)];
        let slots = evenings(5, 2);
        let horizon = monday() + Duration::days(1);
        let allocation = allocate(
            &AllocationRequest {
                topics: &topics,
                availability: &slots,
                fixed: &[],
                now: monday(),
                horizon_end: Some(horizon),
            },
            &policy,
        )
        .unwrap();
        assert!(allocation.sessions.iter().all(|s| s.end <= horizon));
    }

    #[test]
    fn test_nothing_to_place() {
        let policy = PlannerConfig::default();
        let allocation = allocate(
            &AllocationRequest {
                topics: &[],
                availability: &[],
                fixed: &[],
                now: monday(),
                horizon_end: None,
            },
            &policy,
        )
        .unwrap();
        assert!(allocation.sessions.is_empty());
    }
}
