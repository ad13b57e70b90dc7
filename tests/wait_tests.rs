//! Integration tests for waitable operations.
//!
//! Wait-open parks until the object is published or its writer walks
//! away; wait-unpublish parks until the caller's open is the only one.
//! Both resolve through the completion queue, so these tests drive the
//! broker and then drain completions the way an embedding loop would.

use depot::broker::{Broker, BrokerConfig, ChannelId, Completion, Outcome};
use depot::protocol::{Request, SharePolicy, Status, PROTOCOL_VERSION};
use depot::token::Token;

fn broker() -> Broker {
    // RUST_LOG=depot=trace surfaces the broker's dispatch spans.
    let _ = tracing_subscriber::fmt::try_init();
    let config = BrokerConfig {
        token_seed: 7,
        ..Default::default()
    };
    Broker::with_heap(64 * 1024, config).unwrap()
}

fn greet(broker: &mut Broker) -> ChannelId {
    let ch = broker.open_channel();
    broker.dispatch(ch, 0, Request::Hello { version: PROTOCOL_VERSION });
    ch
}

fn published_object(broker: &mut Broker, writer: ChannelId, size: u64) -> Token {
    let token = broker
        .dispatch(
            writer,
            1,
            Request::Alloc { size, clear: false, policy: SharePolicy::Standard },
        )
        .into_reply()
        .unwrap()
        .token
        .unwrap();
    assert!(broker
        .dispatch(writer, 2, Request::Publish { token })
        .into_reply()
        .unwrap()
        .is_ok());
    token
}

fn drain(broker: &mut Broker) -> Vec<Completion> {
    let mut out = Vec::new();
    while let Some(c) = broker.next_completion() {
        out.push(c);
    }
    out
}

// ============================================================================
// Wait-Open Tests
// ============================================================================

/// Test that wait-opens park and complete when the writer publishes.
#[test]
fn test_wait_open_completes_on_publish() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let r1 = greet(&mut broker);
    let r2 = greet(&mut broker);

    let token = broker
        .dispatch(
            writer,
            1,
            Request::Alloc { size: 300, clear: false, policy: SharePolicy::Standard },
        )
        .into_reply()
        .unwrap()
        .token
        .unwrap();

    // Both readers park.
    let outcome =
        broker.dispatch(r1, 10, Request::Open { token, policy: SharePolicy::Standard, wait: true });
    assert_eq!(outcome, Outcome::Pending);
    let outcome =
        broker.dispatch(r2, 20, Request::Open { token, policy: SharePolicy::Standard, wait: true });
    assert_eq!(outcome, Outcome::Pending);
    assert!(drain(&mut broker).is_empty());
    broker.verify_invariants();

    assert!(broker
        .dispatch(writer, 2, Request::Publish { token })
        .into_reply()
        .unwrap()
        .is_ok());

    // Completions arrive newest-waiter-first.
    let completions = drain(&mut broker);
    assert_eq!(completions.len(), 2);
    assert_eq!(completions[0].channel, r2);
    assert_eq!(completions[0].response.seq, 20);
    assert_eq!(completions[1].channel, r1);
    assert_eq!(completions[1].response.seq, 10);
    for c in &completions {
        assert!(c.response.is_ok());
        assert_eq!(c.response.token, Some(token));
        assert!(c.response.offset.is_some());
    }
    broker.verify_invariants();

    // Every completed wait is a real open now.
    for (ch, seq) in [(r1, 11), (r2, 21), (writer, 3)] {
        assert!(broker
            .dispatch(ch, seq, Request::Close { token })
            .into_reply()
            .unwrap()
            .is_ok());
    }
    assert_eq!(broker.stats().objects, 0);
}

/// Test that several parked requests from one channel resume
/// newest-first as well.
#[test]
fn test_wait_open_stacks_per_channel() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let reader = greet(&mut broker);

    let token = broker
        .dispatch(
            writer,
            1,
            Request::Alloc { size: 100, clear: false, policy: SharePolicy::Standard },
        )
        .into_reply()
        .unwrap()
        .token
        .unwrap();

    for seq in [30, 31, 32] {
        let outcome = broker
            .dispatch(reader, seq, Request::Open { token, policy: SharePolicy::Standard, wait: true });
        assert_eq!(outcome, Outcome::Pending);
    }
    broker.dispatch(writer, 2, Request::Publish { token });

    let seqs: Vec<u64> = drain(&mut broker).iter().map(|c| c.response.seq).collect();
    assert_eq!(seqs, vec![32, 31, 30]);
    broker.verify_invariants();

    // Three grants, three closes, plus the writer's.
    for seq in [40, 41, 42] {
        assert!(broker
            .dispatch(reader, seq, Request::Close { token })
            .into_reply()
            .unwrap()
            .is_ok());
    }
    broker.dispatch(writer, 3, Request::Close { token });
    assert_eq!(broker.stats().objects, 0);
}

/// Test that wait-opens complete busy when the writer abandons the
/// object instead of publishing it.
#[test]
fn test_wait_open_cancelled_by_writer_abandon() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let reader = greet(&mut broker);

    let token = broker
        .dispatch(
            writer,
            1,
            Request::Alloc { size: 100, clear: false, policy: SharePolicy::Standard },
        )
        .into_reply()
        .unwrap()
        .token
        .unwrap();
    let outcome = broker
        .dispatch(reader, 10, Request::Open { token, policy: SharePolicy::Standard, wait: true });
    assert_eq!(outcome, Outcome::Pending);

    // The writer closes its only open without publishing.
    assert!(broker
        .dispatch(writer, 2, Request::Close { token })
        .into_reply()
        .unwrap()
        .is_ok());

    let completions = drain(&mut broker);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].channel, reader);
    assert_eq!(completions[0].response.seq, 10);
    assert_eq!(completions[0].response.status, Status::ObjectBusy);

    // The cancelled wait released its reference; nothing is left.
    assert_eq!(broker.stats().objects, 0);
    broker.verify_invariants();
}

/// Test that a wait-open arriving after the writer already walked away
/// fails busy immediately instead of parking forever.
#[test]
fn test_wait_open_after_writer_abandon_fails_fast() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let reader = greet(&mut broker);

    let token = broker
        .dispatch(
            writer,
            1,
            Request::Alloc { size: 100, clear: false, policy: SharePolicy::Standard },
        )
        .into_reply()
        .unwrap()
        .token
        .unwrap();

    // The reader pins the object with a busy-open, then the writer leaves.
    broker.dispatch(reader, 10, Request::Open { token, policy: SharePolicy::Standard, wait: false });
    broker.dispatch(writer, 2, Request::Close { token });
    assert_eq!(broker.stats().objects, 1);

    // Nobody can publish anymore, so the wait form answers right away.
    let reply = broker
        .dispatch(reader, 11, Request::Open { token, policy: SharePolicy::Standard, wait: true })
        .into_reply()
        .unwrap();
    assert_eq!(reply.status, Status::ObjectBusy);
    broker.verify_invariants();

    // Both refusals left references; two closes free the object.
    for seq in [12, 13] {
        assert!(broker
            .dispatch(reader, seq, Request::Close { token })
            .into_reply()
            .unwrap()
            .is_ok());
    }
    assert_eq!(broker.stats().objects, 0);
}

/// Test that a close cannot take a reference a parked wait is counting
/// on.
#[test]
fn test_close_cannot_starve_parked_wait() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let reader = greet(&mut broker);

    let token = broker
        .dispatch(
            writer,
            1,
            Request::Alloc { size: 100, clear: false, policy: SharePolicy::Standard },
        )
        .into_reply()
        .unwrap()
        .token
        .unwrap();
    broker.dispatch(reader, 10, Request::Open { token, policy: SharePolicy::Standard, wait: true });

    // The reader's handle exists only to back the parked wait.
    let reply = broker
        .dispatch(reader, 11, Request::Close { token })
        .into_reply()
        .unwrap();
    assert_eq!(reply.status, Status::InvalidRequest);

    // The wait is unaffected and completes normally.
    broker.dispatch(writer, 2, Request::Publish { token });
    let completions = drain(&mut broker);
    assert_eq!(completions.len(), 1);
    assert!(completions[0].response.is_ok());
    broker.verify_invariants();
}

/// Test that a channel that disconnects while parked gets nothing and
/// holds nothing.
#[test]
fn test_parked_wait_dies_with_channel() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let reader = greet(&mut broker);

    let token = broker
        .dispatch(
            writer,
            1,
            Request::Alloc { size: 100, clear: false, policy: SharePolicy::Standard },
        )
        .into_reply()
        .unwrap()
        .token
        .unwrap();
    broker.dispatch(reader, 10, Request::Open { token, policy: SharePolicy::Standard, wait: true });

    broker.close_channel(reader);
    broker.verify_invariants();

    // Publishing afterwards wakes nobody.
    broker.dispatch(writer, 2, Request::Publish { token });
    assert!(drain(&mut broker).is_empty());

    broker.dispatch(writer, 3, Request::Close { token });
    assert_eq!(broker.stats().objects, 0);
}

// ============================================================================
// Wait-Unpublish Tests
// ============================================================================

/// Test that a wait-unpublish parks until the last other open closes,
/// then completes with a fresh token.
#[test]
fn test_sole_wait_completes_on_last_close() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let reader = greet(&mut broker);

    let token = published_object(&mut broker, writer, 400);
    assert!(broker
        .dispatch(reader, 1, Request::Open { token, policy: SharePolicy::Standard, wait: false })
        .into_reply()
        .unwrap()
        .is_ok());

    let outcome = broker
        .dispatch(writer, 3, Request::Unpublish { token, clear: false, wait: true });
    assert_eq!(outcome, Outcome::Pending);
    assert!(drain(&mut broker).is_empty());
    broker.verify_invariants();

    // The reader lets go; the reclaim fires.
    assert!(broker
        .dispatch(reader, 2, Request::Close { token })
        .into_reply()
        .unwrap()
        .is_ok());

    let completions = drain(&mut broker);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].channel, writer);
    assert_eq!(completions[0].response.seq, 3);
    assert!(completions[0].response.is_ok());
    let new_token = completions[0].response.token.unwrap();
    assert_ne!(new_token, token);

    // The writer owns the recycled object exclusively again.
    assert!(broker
        .dispatch(writer, 4, Request::Resize { token: new_token, new_size: 800 })
        .into_reply()
        .unwrap()
        .is_ok());
    let reply = broker
        .dispatch(reader, 3, Request::Open { token, policy: SharePolicy::Standard, wait: false })
        .into_reply()
        .unwrap();
    assert_eq!(reply.status, Status::NoSuchObject);
    broker.verify_invariants();

    broker.dispatch(writer, 5, Request::Close { token: new_token });
    assert_eq!(broker.stats().objects, 0);
}

/// Test that a waiter closing its own last open cancels its reclaim.
#[test]
fn test_sole_wait_self_cancel() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let reader = greet(&mut broker);

    let token = published_object(&mut broker, writer, 100);
    assert!(broker
        .dispatch(reader, 1, Request::Open { token, policy: SharePolicy::Standard, wait: false })
        .into_reply()
        .unwrap()
        .is_ok());

    // The reader parks a reclaim behind the writer's open, then gives up
    // its own open.
    let outcome = broker
        .dispatch(reader, 2, Request::Unpublish { token, clear: false, wait: true });
    assert_eq!(outcome, Outcome::Pending);
    assert!(broker
        .dispatch(reader, 3, Request::Close { token })
        .into_reply()
        .unwrap()
        .is_ok());

    let completions = drain(&mut broker);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].channel, reader);
    assert_eq!(completions[0].response.seq, 2);
    assert_eq!(completions[0].response.status, Status::ObjectBusy);

    // Still published under the original token.
    assert!(broker
        .dispatch(reader, 4, Request::Open { token, policy: SharePolicy::Standard, wait: false })
        .into_reply()
        .unwrap()
        .is_ok());
    broker.verify_invariants();
}

/// Test that a waiter holding two opens can close one and thereby
/// complete its own parked reclaim.
#[test]
fn test_sole_wait_fires_on_own_extra_close() {
    let mut broker = broker();
    let writer = greet(&mut broker);

    let token = published_object(&mut broker, writer, 100);
    // A second open on the same handle; two opens block the reclaim.
    assert!(broker
        .dispatch(writer, 3, Request::Open { token, policy: SharePolicy::Standard, wait: false })
        .into_reply()
        .unwrap()
        .is_ok());
    let outcome =
        broker.dispatch(writer, 4, Request::Unpublish { token, clear: false, wait: true });
    assert_eq!(outcome, Outcome::Pending);

    // Closing the extra open leaves the waiter's open as the only one,
    // which completes the reclaim under a fresh token.
    assert!(broker
        .dispatch(writer, 5, Request::Close { token })
        .into_reply()
        .unwrap()
        .is_ok());
    let completions = drain(&mut broker);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].channel, writer);
    assert_eq!(completions[0].response.seq, 4);
    assert!(completions[0].response.is_ok());
    let new_token = completions[0].response.token.unwrap();
    assert_ne!(new_token, token);
    broker.verify_invariants();

    // The old token is gone; the handle answers under the new one.
    let reply = broker
        .dispatch(writer, 6, Request::Close { token })
        .into_reply()
        .unwrap();
    assert_eq!(reply.status, Status::NoSuchObject);
    assert!(broker
        .dispatch(writer, 7, Request::Publish { token: new_token })
        .into_reply()
        .unwrap()
        .is_ok());
    broker.dispatch(writer, 8, Request::Close { token: new_token });
    assert_eq!(broker.stats().objects, 0);
}

/// Test the immediate busy answers: no open to wait behind, or the wait
/// slot already taken.
#[test]
fn test_sole_wait_busy_refusals() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let r1 = greet(&mut broker);
    let r2 = greet(&mut broker);

    // r1 takes a reference while the object is still being written, so it
    // ends up holding the published object with no open.
    let token = broker
        .dispatch(
            writer,
            1,
            Request::Alloc { size: 100, clear: false, policy: SharePolicy::Standard },
        )
        .into_reply()
        .unwrap()
        .token
        .unwrap();
    let reply = broker
        .dispatch(r1, 1, Request::Open { token, policy: SharePolicy::Standard, wait: false })
        .into_reply()
        .unwrap();
    assert_eq!(reply.status, Status::ObjectBusy);
    broker.dispatch(writer, 2, Request::Publish { token });

    // No open of its own: parking would never resolve.
    let reply = broker
        .dispatch(r1, 2, Request::Unpublish { token, clear: false, wait: true })
        .into_reply()
        .unwrap();
    assert_eq!(reply.status, Status::ObjectBusy);

    // One parked reclaim at a time.
    broker.dispatch(r2, 1, Request::Open { token, policy: SharePolicy::Standard, wait: false });
    let outcome = broker
        .dispatch(writer, 3, Request::Unpublish { token, clear: false, wait: true });
    assert_eq!(outcome, Outcome::Pending);
    let reply = broker
        .dispatch(r2, 2, Request::Unpublish { token, clear: false, wait: true })
        .into_reply()
        .unwrap();
    assert_eq!(reply.status, Status::ObjectBusy);
    broker.verify_invariants();
}

/// Test that a parked reclaim fires when the channel holding the other
/// open disconnects instead of closing.
#[test]
fn test_sole_wait_fires_on_teardown_of_other_channel() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let reader = greet(&mut broker);

    let token = published_object(&mut broker, writer, 100);
    broker.dispatch(reader, 1, Request::Open { token, policy: SharePolicy::Standard, wait: false });

    let outcome = broker
        .dispatch(writer, 3, Request::Unpublish { token, clear: true, wait: true });
    assert_eq!(outcome, Outcome::Pending);

    broker.close_channel(reader);

    let completions = drain(&mut broker);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].channel, writer);
    assert!(completions[0].response.is_ok());
    assert!(completions[0].response.token.is_some());
    broker.verify_invariants();
}

/// Test that a disconnecting waiter abandons its parked reclaim without
/// disturbing the object.
#[test]
fn test_sole_wait_dies_with_waiter_channel() {
    let mut broker = broker();
    let writer = greet(&mut broker);
    let reader = greet(&mut broker);

    let token = published_object(&mut broker, writer, 100);
    broker.dispatch(reader, 1, Request::Open { token, policy: SharePolicy::Standard, wait: false });
    let outcome = broker
        .dispatch(reader, 2, Request::Unpublish { token, clear: false, wait: true });
    assert_eq!(outcome, Outcome::Pending);

    broker.close_channel(reader);
    assert!(drain(&mut broker).is_empty());
    broker.verify_invariants();

    // The writer still holds a published object under the original token.
    assert!(broker
        .dispatch(writer, 3, Request::Open { token, policy: SharePolicy::Standard, wait: false })
        .into_reply()
        .unwrap()
        .is_ok());
    assert_eq!(broker.stats().objects, 1);
}
