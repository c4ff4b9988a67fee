//! Worker loop: lease a relay, drive it, release.
//!
//! Within one relay, actions are totally ordered: the outcome of action `n`
//! is persisted before action `n+1` is issued, and a transition is applied
//! in memory only after the persistent write succeeded. The refund path and
//! the forward path never overlap because a single worker holds the lease
//! and runs them sequentially.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tracing::{debug, info, instrument, warn};

use fusion_core::time::{now_millis, now_secs};
use fusion_core::{
    AttemptAction, AttemptStatus, ChainError, Relay, RelayAttempt, RelayStatus, RouteHop,
    StoreError,
};

use super::RelayEngine;

/// What a single step decided.
enum StepOutcome {
    /// Progress was made; keep driving.
    Continue,
    /// Nothing to do for a while; re-attempt after the delay.
    Wait(Duration),
    /// The relay reached a terminal state (or the lease must be dropped).
    Done,
}

const PERSIST_ATTEMPTS: u32 = 3;

pub(super) async fn run_worker(engine: Arc<RelayEngine>, worker_id: String) -> Result<()> {
    let poll = Duration::from_millis(engine.config.poll_interval_ms);
    loop {
        let leased = engine
            .store
            .lease_next_ready(&worker_id, engine.config.lease_ttl())
            .await;
        match leased {
            Ok(Some(relay)) => {
                let relay_id = relay.id.clone();
                debug!(relay_id = %relay_id, "worker claimed relay");
                if let Err(err) = drive(&engine, &worker_id, relay).await {
                    warn!(relay_id = %relay_id, %err, "relay drive aborted");
                }
                if let Err(err) = engine.store.release_lease(&relay_id, &worker_id).await {
                    warn!(relay_id = %relay_id, %err, "lease release failed");
                }
            }
            Ok(None) => tokio::time::sleep(poll).await,
            Err(err) => {
                warn!(%err, "lease acquisition failed");
                tokio::time::sleep(poll).await;
            }
        }
    }
}

#[instrument(skip(engine, relay), fields(relay_id = %relay.id, status = %relay.status))]
async fn drive(engine: &RelayEngine, worker: &str, mut relay: Relay) -> Result<()> {
    reconcile_if_orphaned(engine, &mut relay).await?;

    loop {
        if relay.status.is_terminal() && relay.status != RelayStatus::Expired {
            return Ok(());
        }

        let buffer = engine.refund_buffer(&relay);
        let refund_due = relay.refund_due(now_secs(), buffer);
        let outcome = if relay.status == RelayStatus::Expired || refund_due {
            run_refund(engine, &mut relay).await?
        } else {
            match relay.status {
                RelayStatus::Pending | RelayStatus::Routing => {
                    run_route_discovery(engine, &mut relay).await?
                }
                RelayStatus::Executing => run_lock_target(engine, &mut relay).await?,
                RelayStatus::Confirming => run_confirm(engine, &mut relay).await?,
                // Terminal states were handled above.
                _ => StepOutcome::Done,
            }
        };

        match outcome {
            StepOutcome::Continue => {
                if !heartbeat(engine, worker, &relay).await {
                    return Ok(());
                }
            }
            StepOutcome::Wait(delay) => {
                // Short waits are served in place under the lease; long ones
                // drop the lease and the relay is re-claimed later.
                let cap = engine.config.lease_ttl() / 3;
                if delay > cap {
                    debug!(?delay, "parking relay until a later lease");
                    return Ok(());
                }
                if !heartbeat(engine, worker, &relay).await {
                    return Ok(());
                }
                tokio::time::sleep(delay).await;
            }
            StepOutcome::Done => return Ok(()),
        }
    }
}

async fn heartbeat(engine: &RelayEngine, worker: &str, relay: &Relay) -> bool {
    match engine
        .store
        .heartbeat_lease(&relay.id, worker, engine.config.lease_ttl())
        .await
    {
        Ok(true) => true,
        Ok(false) => {
            warn!(relay_id = %relay.id, "lease expired under us; abandoning the relay");
            false
        }
        Err(err) => {
            warn!(relay_id = %relay.id, %err, "lease heartbeat failed");
            false
        }
    }
}

/// On restart, a relay mid-flight carries an in-progress attempt nobody will
/// settle. The orphan stays in place; a reconcile attempt is appended and
/// on-chain truth decides the next action.
async fn reconcile_if_orphaned(engine: &RelayEngine, relay: &mut Relay) -> Result<()> {
    if !matches!(
        relay.status,
        RelayStatus::Routing | RelayStatus::Executing | RelayStatus::Confirming
    ) {
        return Ok(());
    }
    let attempts = engine.store.list_attempts(&relay.id).await?;
    let orphaned = attempts
        .last()
        .map(|a| a.status == AttemptStatus::InProgress)
        .unwrap_or(false);
    if !orphaned {
        return Ok(());
    }

    info!(relay_id = %relay.id, status = %relay.status, "reconciling against on-chain truth");
    let number = engine.store.next_attempt_number(&relay.id).await?;
    let mut attempt = RelayAttempt::begin(&relay.id, number, AttemptAction::Reconcile);
    persist_attempt(engine, &attempt).await?;

    match relay.status {
        RelayStatus::Executing => {
            let Some(gateway) = engine.gateway(&relay.target_chain) else {
                return Ok(());
            };
            match gateway
                .get_htlc(&target_htlc_id(relay), engine.config.action_timeout())
                .await
            {
                Ok(found) => {
                    let locked = found.is_some();
                    attempt.settle(AttemptStatus::Success);
                    attempt.metadata = Some(serde_json::json!({ "target_locked": locked }));
                    if locked {
                        // The crash happened after the lock landed.
                        let mut updated = relay.clone();
                        advance(&mut updated, RelayStatus::Confirming)?;
                        persist_txn(engine, &updated, &attempt).await?;
                        *relay = updated;
                    } else {
                        persist_attempt(engine, &attempt).await?;
                    }
                }
                Err(err) => {
                    attempt.settle(AttemptStatus::Failed);
                    attempt.error_message = Some(err.to_string());
                    persist_attempt(engine, &attempt).await?;
                }
            }
        }
        RelayStatus::Confirming => {
            let Some(gateway) = engine.gateway(&relay.source_chain) else {
                return Ok(());
            };
            match gateway
                .get_htlc(&relay.htlc_id, engine.config.action_timeout())
                .await
            {
                Ok(Some(details)) if details.state == fusion_core::HtlcState::Withdrawn => {
                    // We revealed the secret before the crash.
                    attempt.settle(AttemptStatus::Success);
                    let mut updated = relay.clone();
                    advance(&mut updated, RelayStatus::Completed)?;
                    persist_txn(engine, &updated, &attempt).await?;
                    record_terminal(engine, &updated);
                    *relay = updated;
                }
                Ok(_) => {
                    attempt.settle(AttemptStatus::Success);
                    persist_attempt(engine, &attempt).await?;
                }
                Err(err) => {
                    attempt.settle(AttemptStatus::Failed);
                    attempt.error_message = Some(err.to_string());
                    persist_attempt(engine, &attempt).await?;
                }
            }
        }
        // Route discovery holds no on-chain state; the next step re-runs it.
        _ => {
            attempt.settle(AttemptStatus::Success);
            persist_attempt(engine, &attempt).await?;
        }
    }
    Ok(())
}

async fn run_route_discovery(engine: &RelayEngine, relay: &mut Relay) -> Result<StepOutcome> {
    let number = engine.store.next_attempt_number(&relay.id).await?;
    let mut attempt = RelayAttempt::begin(&relay.id, number, AttemptAction::RouteDiscovery);

    if relay.status == RelayStatus::Pending {
        let mut updated = relay.clone();
        advance(&mut updated, RelayStatus::Routing)?;
        persist_txn(engine, &updated, &attempt).await?;
        *relay = updated;
    } else {
        persist_attempt(engine, &attempt).await?;
    }

    match resolve_route(engine, relay) {
        Ok(route) => {
            attempt.settle(AttemptStatus::Success);
            let mut updated = relay.clone();
            updated.route = route;
            advance(&mut updated, RelayStatus::Executing)?;
            persist_txn(engine, &updated, &attempt).await?;
            *relay = updated;
            Ok(StepOutcome::Continue)
        }
        Err(reason) => {
            // No route is a hard failure; retrying cannot invent one.
            attempt.settle(AttemptStatus::Failed);
            attempt.error_message = Some(reason.clone());
            fail_relay(engine, relay, attempt, &reason).await?;
            Ok(StepOutcome::Done)
        }
    }
}

fn resolve_route(engine: &RelayEngine, relay: &Relay) -> Result<Vec<RouteHop>, String> {
    if !relay.route.is_empty() {
        let mut position = relay.source_chain.as_str();
        for hop in &relay.route {
            if hop.from_chain != position {
                return Err(format!(
                    "route hop starts at `{}` but the swap is at `{position}`",
                    hop.from_chain
                ));
            }
            if engine.gateway(&hop.to_chain).is_none() && hop.to_chain != relay.target_chain {
                return Err(format!("route hop crosses unconfigured chain `{}`", hop.to_chain));
            }
            position = hop.to_chain.as_str();
        }
        if position != relay.target_chain {
            return Err(format!(
                "route ends at `{position}`, expected `{}`",
                relay.target_chain
            ));
        }
        return Ok(relay.route.clone());
    }
    if engine.gateway(&relay.target_chain).is_some() {
        return Ok(vec![RouteHop {
            from_chain: relay.source_chain.clone(),
            to_chain: relay.target_chain.clone(),
            channel: None,
        }]);
    }
    Err(format!(
        "no route from `{}` to `{}`",
        relay.source_chain, relay.target_chain
    ))
}

async fn run_lock_target(engine: &RelayEngine, relay: &mut Relay) -> Result<StepOutcome> {
    let failures = action_failures(engine, &relay.id, AttemptAction::LockTarget).await?;
    if failures >= engine.config.max_action_retries {
        return out_of_retries(engine, relay, "lock_target").await;
    }

    let gateway = engine
        .gateway(&relay.target_chain)
        .ok_or_else(|| eyre::eyre!("no gateway for `{}`", relay.target_chain))?;

    let number = engine.store.next_attempt_number(&relay.id).await?;
    let mut attempt = RelayAttempt::begin(&relay.id, number, AttemptAction::LockTarget);
    persist_attempt(engine, &attempt).await?;

    let buffer = engine.refund_buffer(relay);
    let deadline = action_deadline(engine, relay, buffer);
    // The mirror lock must expire before the source HTLC so the reveal on
    // the source side always has headroom.
    let params = fusion_core::HtlcParams {
        htlc_id: target_htlc_id(relay),
        sender: relay.sender.clone(),
        recipient: relay.recipient.clone(),
        amount: relay.amount.clone(),
        token: relay.token.clone(),
        hashlock: relay.hashlock.clone(),
        timelock: relay.timelock - buffer,
    };
    let started = now_millis();

    match gateway.create_htlc(&params, deadline).await {
        Ok(receipt) => {
            attempt.settle(AttemptStatus::Success);
            attempt.tx_hash = Some(receipt.tx_hash);
            attempt.gas_used = receipt.gas_used;
            observe_attempt(engine, &attempt, started, "success");
            let mut updated = relay.clone();
            advance(&mut updated, RelayStatus::Confirming)?;
            set_metadata(&mut updated, "target_htlc_id", serde_json::json!(params.htlc_id));
            persist_txn(engine, &updated, &attempt).await?;
            *relay = updated;
            Ok(StepOutcome::Continue)
        }
        Err(err) => {
            let chain = relay.target_chain.clone();
            handle_chain_failure(engine, relay, attempt, err, failures, started, &chain).await
        }
    }
}

async fn run_confirm(engine: &RelayEngine, relay: &mut Relay) -> Result<StepOutcome> {
    let target_gateway = engine
        .gateway(&relay.target_chain)
        .ok_or_else(|| eyre::eyre!("no gateway for `{}`", relay.target_chain))?;
    let poll_delay = Duration::from_millis(engine.config.retry_base_ms);

    // Watching for the counterparty's claim is a read poll, not an attempt.
    let details = match target_gateway
        .get_htlc(&target_htlc_id(relay), engine.config.action_timeout())
        .await
    {
        Ok(details) => details,
        Err(err) => {
            engine
                .metrics
                .chain_errors
                .with_label_values(&[&relay.target_chain, &err.class().to_string()])
                .inc();
            return Ok(StepOutcome::Wait(engine.backoff.delay(1)));
        }
    };

    let preimage = match details {
        Some(htlc) if htlc.state == fusion_core::HtlcState::Withdrawn => match htlc.preimage {
            Some(preimage) => preimage,
            None => return Ok(StepOutcome::Wait(poll_delay)),
        },
        Some(htlc) if htlc.state == fusion_core::HtlcState::Refunded => {
            // The mirror lock expired; our own refund window is the way out.
            let mut updated = relay.clone();
            updated.last_error = Some("target HTLC refunded before the secret was revealed".into());
            persist_relay(engine, &updated).await?;
            *relay = updated;
            let buffer = engine.refund_buffer(relay);
            let wait = (relay.timelock - buffer - now_secs()).max(1) as u64;
            return Ok(StepOutcome::Wait(Duration::from_secs(wait)));
        }
        Some(_) => return Ok(StepOutcome::Wait(poll_delay)),
        None => {
            warn!(relay_id = %relay.id, "target HTLC not found while confirming");
            return Ok(StepOutcome::Wait(engine.backoff.delay(1)));
        }
    };

    // The secret is out; reveal it on the source side to collect.
    let failures = action_failures(engine, &relay.id, AttemptAction::RevealSecret).await?;
    if failures >= engine.config.max_action_retries {
        return out_of_retries(engine, relay, "reveal_secret").await;
    }
    let source_gateway = engine
        .gateway(&relay.source_chain)
        .ok_or_else(|| eyre::eyre!("no gateway for `{}`", relay.source_chain))?;

    let number = engine.store.next_attempt_number(&relay.id).await?;
    let mut attempt = RelayAttempt::begin(&relay.id, number, AttemptAction::RevealSecret);
    persist_attempt(engine, &attempt).await?;

    let buffer = engine.refund_buffer(relay);
    let deadline = action_deadline(engine, relay, buffer);
    let started = now_millis();
    match source_gateway
        .withdraw(&relay.htlc_id, &preimage, deadline)
        .await
    {
        Ok(receipt) => {
            attempt.settle(AttemptStatus::Success);
            attempt.tx_hash = Some(receipt.tx_hash);
            attempt.gas_used = receipt.gas_used;
            observe_attempt(engine, &attempt, started, "success");
            let mut updated = relay.clone();
            advance(&mut updated, RelayStatus::Completed)?;
            persist_txn(engine, &updated, &attempt).await?;
            record_terminal(engine, &updated);
            *relay = updated;
            info!(relay_id = %relay.id, "relay completed");
            Ok(StepOutcome::Done)
        }
        Err(err) => {
            let chain = relay.source_chain.clone();
            handle_chain_failure(engine, relay, attempt, err, failures, started, &chain).await
        }
    }
}

async fn run_refund(engine: &RelayEngine, relay: &mut Relay) -> Result<StepOutcome> {
    // Record expiry first; the refund transaction follows.
    if relay.status != RelayStatus::Expired {
        let mut updated = relay.clone();
        advance(&mut updated, RelayStatus::Expired)?;
        if updated.last_error.is_none() {
            updated.last_error = Some("timelock expired".into());
        }
        persist_relay(engine, &updated).await?;
        *relay = updated;
        info!(relay_id = %relay.id, "relay expired; starting refund");
    }

    let failures = action_failures(engine, &relay.id, AttemptAction::Refund).await?;
    if failures >= engine.config.max_action_retries {
        // Out of refund retries there is nothing safe left to do
        // automatically; surface loudly and keep the relay visible.
        if relay.last_error.as_deref() != Some("refund retry budget exhausted") {
            let mut updated = relay.clone();
            updated.last_error = Some("refund retry budget exhausted".into());
            persist_relay(engine, &updated).await?;
            *relay = updated;
        }
        warn!(relay_id = %relay.id, "refund budget exhausted; manual intervention required");
        return Ok(StepOutcome::Wait(Duration::from_secs(3_600)));
    }

    let gateway = engine
        .gateway(&relay.source_chain)
        .ok_or_else(|| eyre::eyre!("no gateway for `{}`", relay.source_chain))?;

    let number = engine.store.next_attempt_number(&relay.id).await?;
    let mut attempt = RelayAttempt::begin(&relay.id, number, AttemptAction::Refund);
    persist_attempt(engine, &attempt).await?;

    let started = now_millis();
    match gateway
        .refund(&relay.htlc_id, engine.config.action_timeout())
        .await
    {
        Ok(receipt) => {
            attempt.settle(AttemptStatus::Success);
            attempt.tx_hash = Some(receipt.tx_hash);
            attempt.gas_used = receipt.gas_used;
            observe_attempt(engine, &attempt, started, "success");
            let mut updated = relay.clone();
            advance(&mut updated, RelayStatus::Refunded)?;
            persist_txn(engine, &updated, &attempt).await?;
            record_terminal(engine, &updated);
            *relay = updated;
            info!(relay_id = %relay.id, "relay refunded");
            Ok(StepOutcome::Done)
        }
        Err(ChainError::Rejected(reason)) => {
            // The chain may have beaten us to it; check before failing.
            let on_chain = gateway
                .get_htlc(&relay.htlc_id, engine.config.action_timeout())
                .await
                .ok()
                .flatten();
            if on_chain.map(|h| h.state) == Some(fusion_core::HtlcState::Refunded) {
                attempt.settle(AttemptStatus::Success);
                attempt.metadata = Some(serde_json::json!({ "already_refunded": true }));
                let mut updated = relay.clone();
                advance(&mut updated, RelayStatus::Refunded)?;
                persist_txn(engine, &updated, &attempt).await?;
                record_terminal(engine, &updated);
                *relay = updated;
                return Ok(StepOutcome::Done);
            }
            attempt.settle(AttemptStatus::Failed);
            attempt.error_message = Some(reason.clone());
            observe_attempt(engine, &attempt, started, "failed");
            fail_relay(engine, relay, attempt, &format!("refund rejected: {reason}")).await?;
            Ok(StepOutcome::Done)
        }
        Err(err) => {
            let settled = if matches!(err, ChainError::Timeout(_)) {
                AttemptStatus::Timeout
            } else {
                AttemptStatus::Failed
            };
            attempt.settle(settled);
            attempt.error_message = Some(err.to_string());
            observe_attempt(engine, &attempt, started, "failed");
            let mut updated = relay.clone();
            updated.retry_count += 1;
            updated.last_error = Some(format!("{}: {err}", err.code()));
            persist_txn(engine, &updated, &attempt).await?;
            *relay = updated;
            Ok(StepOutcome::Wait(engine.backoff.delay(failures + 1)))
        }
    }
}

/// Shared failure handling for forward actions.
#[allow(clippy::too_many_arguments)]
async fn handle_chain_failure(
    engine: &RelayEngine,
    relay: &mut Relay,
    mut attempt: RelayAttempt,
    err: ChainError,
    prior_failures: u32,
    started: i64,
    chain: &str,
) -> Result<StepOutcome> {
    engine
        .metrics
        .chain_errors
        .with_label_values(&[chain, &err.class().to_string()])
        .inc();

    match &err {
        ChainError::Rejected(reason) => {
            // One diagnostic read before giving up, recorded on the attempt.
            let htlc_id = if chain == relay.source_chain {
                relay.htlc_id.clone()
            } else {
                target_htlc_id(relay)
            };
            let diagnostics = match engine.gateway(chain) {
                Some(gateway) => gateway
                    .get_htlc(&htlc_id, engine.config.action_timeout())
                    .await
                    .ok()
                    .flatten()
                    .map(|htlc| serde_json::json!({ "on_chain_state": htlc.state })),
                None => None,
            };
            attempt.settle(AttemptStatus::Failed);
            attempt.error_message = Some(reason.clone());
            attempt.metadata = diagnostics;
            observe_attempt(engine, &attempt, started, "failed");
            fail_relay(engine, relay, attempt, &format!("{}: {reason}", err.code())).await?;
            Ok(StepOutcome::Done)
        }
        _ => {
            let settled = if matches!(err, ChainError::Timeout(_)) {
                AttemptStatus::Timeout
            } else {
                AttemptStatus::Failed
            };
            attempt.settle(settled);
            attempt.error_message = Some(err.to_string());
            observe_attempt(engine, &attempt, started, "failed");
            let mut updated = relay.clone();
            updated.retry_count += 1;
            updated.last_error = Some(format!("{}: {err}", err.code()));
            persist_txn(engine, &updated, &attempt).await?;
            *relay = updated;
            Ok(StepOutcome::Wait(engine.backoff.delay(prior_failures + 1)))
        }
    }
}

/// Forward retries are spent; park until the refund window opens (the
/// timelock is the safety net), or fail outright when it already passed.
async fn out_of_retries(
    engine: &RelayEngine,
    relay: &mut Relay,
    action: &str,
) -> Result<StepOutcome> {
    let buffer = engine.refund_buffer(relay);
    let until_refund = relay.timelock - buffer - now_secs();
    let exhausted = format!("{action} retry budget exhausted");
    if relay.last_error.as_deref() != Some(exhausted.as_str()) {
        let mut updated = relay.clone();
        updated.last_error = Some(exhausted);
        persist_relay(engine, &updated).await?;
        *relay = updated;
    }
    if until_refund > 0 {
        debug!(relay_id = %relay.id, until_refund, "retries spent; waiting for the refund window");
        Ok(StepOutcome::Wait(Duration::from_secs(until_refund as u64)))
    } else {
        // The refund branch takes over on the next drive iteration.
        Ok(StepOutcome::Continue)
    }
}

async fn fail_relay(
    engine: &RelayEngine,
    relay: &mut Relay,
    attempt: RelayAttempt,
    reason: &str,
) -> Result<()> {
    let mut updated = relay.clone();
    updated.last_error = Some(reason.to_string());
    advance(&mut updated, RelayStatus::Failed)?;
    persist_txn(engine, &updated, &attempt).await?;
    record_terminal(engine, &updated);
    *relay = updated;
    warn!(relay_id = %relay.id, reason, "relay failed");
    Ok(())
}

fn record_terminal(engine: &RelayEngine, relay: &Relay) {
    engine
        .metrics
        .relays_processed
        .with_label_values(&[
            &relay.source_chain,
            &relay.target_chain,
            &relay.status.to_string(),
        ])
        .inc();
}

fn observe_attempt(engine: &RelayEngine, attempt: &RelayAttempt, started: i64, outcome: &str) {
    let elapsed = (now_millis() - started).max(0) as f64 / 1_000.0;
    engine
        .metrics
        .attempt_duration
        .with_label_values(&[&attempt.action.to_string(), outcome])
        .observe(elapsed);
}

fn advance(relay: &mut Relay, next: RelayStatus) -> Result<(), StoreError> {
    if !relay.status.can_transition_to(next) {
        return Err(StoreError::IllegalTransition {
            from: relay.status,
            to: next,
        });
    }
    relay.status = next;
    relay.updated_at = now_millis();
    Ok(())
}

fn set_metadata(relay: &mut Relay, key: &str, value: serde_json::Value) {
    if !relay.metadata.is_object() {
        relay.metadata = serde_json::json!({});
    }
    if let Some(map) = relay.metadata.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

/// Deterministic mirror-HTLC handle; makes `create_htlc` idempotent across
/// crashes and addressable during reconciliation.
fn target_htlc_id(relay: &Relay) -> String {
    relay
        .metadata
        .get("target_htlc_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-target", relay.id))
}

fn action_deadline(engine: &RelayEngine, relay: &Relay, buffer: i64) -> Duration {
    let until_refund = relay.timelock - buffer - now_secs();
    let cap = engine.config.action_timeout();
    if until_refund <= 1 {
        Duration::from_secs(1)
    } else {
        cap.min(Duration::from_secs(until_refund as u64))
    }
}

async fn action_failures(
    engine: &RelayEngine,
    relay_id: &str,
    action: AttemptAction,
) -> Result<u32, StoreError> {
    let attempts = engine.store.list_attempts(relay_id).await?;
    Ok(attempts
        .iter()
        .filter(|a| {
            a.action == action
                && matches!(a.status, AttemptStatus::Failed | AttemptStatus::Timeout)
        })
        .count() as u32)
}

/// Persist a relay/attempt pair atomically, retrying transient failures.
/// The in-memory relay is only advanced by callers after this succeeds.
async fn persist_txn(engine: &RelayEngine, relay: &Relay, attempt: &RelayAttempt) -> Result<()> {
    let mut last_err: Option<StoreError> = None;
    for n in 1..=PERSIST_ATTEMPTS {
        let result = async {
            let mut txn = engine.store.begin_transaction().await?;
            txn.save_relay(relay).await?;
            txn.save_attempt(attempt).await?;
            txn.commit().await
        }
        .await;
        match result {
            Ok(()) => {
                engine.mark_healthy();
                return Ok(());
            }
            Err(err) if err.is_transient() && n < PERSIST_ATTEMPTS => {
                warn!(relay_id = %relay.id, attempt = n, %err, "transition persist failed; retrying");
                tokio::time::sleep(engine.backoff.delay(n)).await;
                last_err = Some(err);
            }
            Err(err) => {
                engine.mark_unhealthy();
                return Err(err.into());
            }
        }
    }
    engine.mark_unhealthy();
    Err(last_err
        .unwrap_or(StoreError::Transient("persist retries exhausted".into()))
        .into())
}

async fn persist_attempt(engine: &RelayEngine, attempt: &RelayAttempt) -> Result<()> {
    for n in 1..=PERSIST_ATTEMPTS {
        match engine.store.save_attempt(attempt).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && n < PERSIST_ATTEMPTS => {
                warn!(relay_id = %attempt.relay_id, attempt = n, %err, "attempt persist failed; retrying");
                tokio::time::sleep(engine.backoff.delay(n)).await;
            }
            Err(err) => {
                engine.mark_unhealthy();
                return Err(err.into());
            }
        }
    }
    unreachable!("loop returns on success or final error")
}

async fn persist_relay(engine: &RelayEngine, relay: &Relay) -> Result<()> {
    for n in 1..=PERSIST_ATTEMPTS {
        match engine.store.save_relay(relay).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && n < PERSIST_ATTEMPTS => {
                warn!(relay_id = %relay.id, attempt = n, %err, "relay persist failed; retrying");
                tokio::time::sleep(engine.backoff.delay(n)).await;
            }
            Err(err) => {
                engine.mark_unhealthy();
                return Err(err.into());
            }
        }
    }
    unreachable!("loop returns on success or final error")
}
