//! The acknowledgement engine: five modes driven from the two hooks a
//! delivery runs through (`before_message_is_consumed`,
//! `after_message_is_consumed`), plus the explicit `Acknowledge()` and
//! rollback paths a caller or a transaction reaches in from outside.

use std::{
    collections::VecDeque,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use tracing::warn;

use crate::{
    command::{AckType, Command, Message, MessageAck, MessageDispatch},
    ids::MessageId,
    transaction::{Synchronization, SynchronizationOwner},
    Error, Result,
};

use super::{AcknowledgementMode, DispatchedState, MessageConsumer};

fn build_ack(
    consumer: &MessageConsumer,
    dispatched: &VecDeque<MessageDispatch>,
    ack_type: AckType,
    transaction_id: Option<crate::ids::TransactionId>,
) -> Option<MessageAck> {
    let last = dispatched.front()?.message.as_ref()?.message_id.clone();
    let first = dispatched.back()?.message.as_ref()?.message_id.clone();
    Some(MessageAck {
        ack_type,
        consumer_id: consumer.consumer_id.clone(),
        destination: consumer.destination.clone(),
        first_message_id: first,
        last_message_id: last,
        message_count: dispatched.len() as u32,
        transaction_id,
    })
}

/// First entry in `dispatched` (index 0) must be the oldest, matching the
/// order `on_rollback` drains its batch in.
fn build_ack_from_slice(
    consumer: &MessageConsumer,
    dispatched: &[MessageDispatch],
    ack_type: AckType,
) -> Option<MessageAck> {
    let first = dispatched.first()?.message.as_ref()?.message_id.clone();
    let last = dispatched.last()?.message.as_ref()?.message_id.clone();
    Some(MessageAck {
        ack_type,
        consumer_id: consumer.consumer_id.clone(),
        destination: consumer.destination.clone(),
        first_message_id: first,
        last_message_id: last,
        message_count: dispatched.len() as u32,
        transaction_id: None,
    })
}

fn send_ack(consumer: &MessageConsumer, ack: MessageAck, sync: bool) -> Result<()> {
    if sync {
        consumer.session.send_sync(Command::MessageAck(ack), None).map(|_| ())
    } else {
        consumer.session.send_oneway(Command::MessageAck(ack))
    }
}

/// Merge `new_ack` into whatever is pending. Same type: extend the range.
/// Existing is a `Delivered` hint being superseded by something else: drop
/// it silently. Otherwise the existing ack is about to be orphaned by a
/// different type arriving — flush it first so it isn't lost.
fn ack_later(consumer: &MessageConsumer, state: &mut DispatchedState, new_ack: MessageAck) -> Result<()> {
    match state.pending_ack.take() {
        None => state.pending_ack = Some(new_ack),
        Some(mut existing) => {
            if existing.ack_type == new_ack.ack_type {
                existing.last_message_id = new_ack.last_message_id;
                existing.message_count += new_ack.message_count;
                state.pending_ack = Some(existing);
            } else if existing.ack_type == AckType::Delivered {
                state.pending_ack = Some(new_ack);
            } else {
                send_ack(consumer, existing, false)?;
                state.pending_ack = Some(new_ack);
            }
        }
    }
    Ok(())
}

fn ack_later_one(consumer: &MessageConsumer, ack_type: AckType, message: &Message) -> Result<()> {
    let ack = MessageAck {
        ack_type,
        consumer_id: consumer.consumer_id.clone(),
        destination: consumer.destination.clone(),
        first_message_id: message.message_id.clone(),
        last_message_id: message.message_id.clone(),
        message_count: 1,
        transaction_id: consumer.session.transaction_id(),
    };
    let mut state = consumer.dispatched.lock().unwrap();
    ack_later(consumer, &mut state, ack)
}

/// Half-prefetch credit-refill heuristic: once delivered-but-unacked
/// messages (net of any additional window the broker already granted)
/// reach half the prefetch, flush so the broker can top the window back up.
fn should_flush(consumer: &MessageConsumer, state: &DispatchedState) -> bool {
    if consumer.prefetch_size == 0 {
        return true;
    }
    let half = i64::from(consumer.prefetch_size) / 2;
    state.delivered_counter - state.additional_window_size >= half.max(1)
}

fn register_transaction_sync(consumer: &MessageConsumer) {
    if consumer.synchronization_registered.swap(true, Ordering::SeqCst) {
        return;
    }
    let Some(arc) = consumer.self_arc() else { return };
    let before_end_target = arc.clone();
    let after_commit_target = arc.clone();
    let after_rollback_target = arc;
    let sync = Synchronization {
        before_end: Some(Box::new(move || flush_transacted_consumed(&before_end_target))),
        after_commit: Some(Box::new(move || on_commit(&after_commit_target))),
        after_rollback: Some(Box::new(move || on_rollback(&after_rollback_target))),
    };
    consumer
        .session
        .register_synchronization(SynchronizationOwner::Consumer(consumer.consumer_id.clone()), sync);
}

/// Sent before the transaction ends, tagged with its id: the broker applies
/// it only if the transaction actually commits, so it's safe to send this
/// unconditionally ahead of knowing whether commit or rollback follows.
fn flush_transacted_consumed(consumer: &MessageConsumer) {
    let state = consumer.dispatched.lock().unwrap();
    let Some(transaction_id) = consumer.session.transaction_id() else { return };
    let Some(ack) = build_ack(consumer, &state.dispatched, AckType::Consumed, Some(transaction_id)) else {
        return;
    };
    drop(state);
    if let Err(err) = send_ack(consumer, ack, false) {
        warn!(%err, "failed to flush the pre-commit consumed acknowledgement");
    }
}

pub(super) fn before_message_is_consumed(consumer: &MessageConsumer, message: &Message) -> Result<()> {
    {
        let mut state = consumer.dispatched.lock().unwrap();
        state.dispatched.push_front(MessageDispatch {
            consumer_id: consumer.consumer_id.clone(),
            destination: consumer.destination.clone(),
            message: Some(message.clone()),
            redelivery_counter: message.redelivery_counter,
        });
        state.delivered_counter += 1;
    }
    match consumer.ack_mode {
        AcknowledgementMode::Transacted => {
            register_transaction_sync(consumer);
            ack_later_one(consumer, AckType::Delivered, message)
        }
        AcknowledgementMode::ClientAcknowledge | AcknowledgementMode::IndividualAcknowledge => {
            ack_later_one(consumer, AckType::Delivered, message)
        }
        AcknowledgementMode::AutoAcknowledgeEach | AcknowledgementMode::AutoAcknowledgeBatch => Ok(()),
    }
}

fn flush_all_consumed(consumer: &MessageConsumer) -> Result<()> {
    let mut state = consumer.dispatched.lock().unwrap();
    if state.dispatched.is_empty() {
        return Ok(());
    }
    let Some(ack) = build_ack(consumer, &state.dispatched, AckType::Consumed, None) else {
        return Ok(());
    };
    state.dispatched.clear();
    state.pending_ack = None;
    state.delivered_counter = 0;
    drop(state);
    send_ack(consumer, ack, false)
}

pub(super) fn after_message_is_consumed(consumer: &MessageConsumer, _expired: bool) -> Result<()> {
    match consumer.ack_mode {
        AcknowledgementMode::AutoAcknowledgeEach => flush_all_consumed(consumer),

        AcknowledgementMode::AutoAcknowledgeBatch => {
            let message_id = {
                let state = consumer.dispatched.lock().unwrap();
                state.dispatched.front().and_then(|d| d.message.as_ref()).map(|m| m.message_id.clone())
            };
            let Some(message_id) = message_id else { return Ok(()) };
            let ack = MessageAck {
                ack_type: AckType::Consumed,
                consumer_id: consumer.consumer_id.clone(),
                destination: consumer.destination.clone(),
                first_message_id: message_id.clone(),
                last_message_id: message_id,
                message_count: 1,
                transaction_id: None,
            };
            let mut state = consumer.dispatched.lock().unwrap();
            ack_later(consumer, &mut state, ack)?;
            if should_flush(consumer, &state) {
                if let Some(pending) = state.pending_ack.take() {
                    state.dispatched.clear();
                    state.delivered_counter = 0;
                    drop(state);
                    send_ack(consumer, pending, false)?;
                }
            }
            Ok(())
        }

        AcknowledgementMode::ClientAcknowledge | AcknowledgementMode::IndividualAcknowledge => {
            let mut state = consumer.dispatched.lock().unwrap();
            if should_flush(consumer, &state) {
                if let Some(pending) = state.pending_ack.take() {
                    drop(state);
                    send_ack(consumer, pending, false)?;
                }
            }
            Ok(())
        }

        AcknowledgementMode::Transacted => Ok(()),
    }
}

pub(super) fn acknowledge(consumer: &MessageConsumer) -> Result<()> {
    if matches!(consumer.ack_mode, AcknowledgementMode::Transacted) {
        // A transacted session's commit/rollback is the only thing that
        // ends delivery; an explicit acknowledge() is a harmless no-op.
        return Ok(());
    }
    if !matches!(consumer.ack_mode, AcknowledgementMode::ClientAcknowledge) {
        return Err(Error::InvalidOperation(
            "acknowledge() requires a client-acknowledge consumer".into(),
        ));
    }
    if consumer.delivering_acks.swap(true, Ordering::SeqCst) {
        return Err(Error::InvalidOperation("a client acknowledgement is already in progress".into()));
    }
    let result = (|| -> Result<()> {
        let mut state = consumer.dispatched.lock().unwrap();
        if state.dispatched.is_empty() {
            return Ok(());
        }
        let Some(ack) = build_ack(consumer, &state.dispatched, AckType::Consumed, None) else {
            return Ok(());
        };
        let cleared = state.dispatched.len() as i64;
        state.dispatched.clear();
        state.pending_ack = None;
        state.redelivery_delay = Duration::ZERO;
        state.redelivery_count = 0;
        state.delivered_counter = (state.delivered_counter - cleared).max(0);
        state.additional_window_size = (state.additional_window_size - cleared).max(0);
        drop(state);
        send_ack(consumer, ack, true)
    })();
    consumer.delivering_acks.store(false, Ordering::SeqCst);
    result
}

pub(super) fn acknowledge_individual(consumer: &MessageConsumer, message_id: &MessageId) -> Result<()> {
    if !matches!(consumer.ack_mode, AcknowledgementMode::IndividualAcknowledge) {
        return Err(Error::InvalidOperation(
            "acknowledge() requires an individual-acknowledge consumer".into(),
        ));
    }
    let mut state = consumer.dispatched.lock().unwrap();
    let position = state
        .dispatched
        .iter()
        .position(|d| d.message.as_ref().map(|m| &m.message_id) == Some(message_id));
    let Some(position) = position else { return Ok(()) };
    state.dispatched.remove(position);
    drop(state);
    let ack = MessageAck {
        ack_type: AckType::Individual,
        consumer_id: consumer.consumer_id.clone(),
        destination: consumer.destination.clone(),
        first_message_id: message_id.clone(),
        last_message_id: message_id.clone(),
        message_count: 1,
        transaction_id: None,
    };
    send_ack(consumer, ack, true)
}

fn on_commit(consumer: &MessageConsumer) {
    let mut state = consumer.dispatched.lock().unwrap();
    state.dispatched.clear();
    state.pending_ack = None;
    state.redelivery_delay = Duration::ZERO;
    state.redelivery_count = 0;
    drop(state);
    consumer.synchronization_registered.store(false, Ordering::SeqCst);
}

/// Everything a rolled-back transacted consumer does with the batch it had
/// delivered: poison-ack it once `maximum_redeliveries` is exhausted,
/// otherwise ack it as redelivered and requeue it at the channel's head
/// after a backoff delay, oldest message first.
fn on_rollback(consumer: &Arc<MessageConsumer>) {
    let (dispatched, redelivery_count_before, redelivery_count) = {
        let mut state = consumer.dispatched.lock().unwrap();
        // Stored head-first (most-recent-first); reverse so index 0 is the
        // oldest message, matching build_ack_from_slice's expectations.
        let mut dispatched: Vec<_> = state.dispatched.drain(..).collect();
        dispatched.reverse();
        state.pending_ack = None;
        let redelivery_count_before = state.redelivery_count;
        state.redelivery_count += 1;
        (dispatched, redelivery_count_before, state.redelivery_count)
    };
    consumer.synchronization_registered.store(false, Ordering::SeqCst);
    if dispatched.is_empty() {
        return;
    }

    if consumer.redelivery_policy.is_exhausted(redelivery_count) {
        if let Some(ack) = build_ack_from_slice(consumer, &dispatched, AckType::Poison) {
            if let Err(err) = send_ack(consumer, ack, false) {
                warn!(%err, "failed to poison-ack an exhausted redelivery batch");
            }
        }
        consumer.dispatched.lock().unwrap().redelivery_count = 0;
        return;
    }

    // Only tell the broker "I've seen these before" once there's been a
    // prior rollback of this batch — a first rollback has no redelivery
    // history to report yet.
    if redelivery_count_before > 0 {
        if let Some(ack) = build_ack_from_slice(consumer, &dispatched, AckType::Redelivered) {
            if let Err(err) = send_ack(consumer, ack, false) {
                warn!(%err, "failed to acknowledge a redelivery batch");
            }
        }
    }

    let jitter_seed = consumer.jitter_counter.fetch_add(1, Ordering::Relaxed) as u64;
    let delay = consumer.redelivery_policy.redelivery_delay(redelivery_count, jitter_seed);

    let mut messages = dispatched;
    for dispatch in &mut messages {
        if let Some(message) = dispatch.message.as_mut() {
            message.on_message_rollback();
        }
    }
    // Reverse back to most-recent-first so `enqueue_first` calls, applied in
    // that order, land the batch at the channel's head in original order.
    messages.reverse();

    let target = consumer.clone();
    let handle = consumer.session.timer().schedule(delay, move || {
        for dispatch in messages {
            target.channel.enqueue_first(dispatch);
        }
    });
    *consumer.pending_redelivery.lock().unwrap() = Some(handle);
}

/// Drain whatever `AckLater` coalesced but never flushed; used on consumer
/// shutdown so a pending auto-ack isn't silently lost.
pub(super) fn flush_pending(consumer: &MessageConsumer) -> Result<()> {
    let mut state = consumer.dispatched.lock().unwrap();
    let Some(ack) = state.pending_ack.take() else { return Ok(()) };
    drop(state);
    send_ack(consumer, ack, false)
}
