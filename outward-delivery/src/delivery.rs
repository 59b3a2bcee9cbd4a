//! The per-message delivery transaction.
//!
//! Recipients are queued per destination domain; `body` fans out one
//! worker per domain, joins them all, and folds the per-recipient
//! outcomes into one status. Workers never share mutable state: each
//! returns its statuses and its connection to the transaction, which
//! settles them with the pool at close.

use std::{collections::HashMap, sync::Arc, time::Instant};

use ahash::AHashMap;
use async_trait::async_trait;
use outward_common::{
    Domain, EnhancedCode, Status, address,
    message::{MessageBody, MessageHeader, MessageMeta},
    target::{StatusCollector, StatusMap, Transaction},
};
use tokio::task::JoinSet;
use tracing::debug;

use crate::{
    connect::{self, MxConn, with_timeout},
    fastpath::FastPathOutcome,
    limits::Slot,
    policy::{self, DeliveryPolicy},
    target::TargetInner,
};

pub(crate) struct Delivery {
    shared: Arc<TargetInner>,
    meta: MessageMeta,
    mail_from: String,
    policies: Arc<Vec<Box<dyn DeliveryPolicy>>>,
    recipients: Vec<String>,
    by_domain: AHashMap<Domain, Vec<String>>,
    connections: Vec<MxConn>,
    msg_slot: Option<Slot>,
}

impl Delivery {
    pub fn new(
        shared: Arc<TargetInner>,
        meta: MessageMeta,
        mail_from: String,
        policies: Vec<Box<dyn DeliveryPolicy>>,
        msg_slot: Option<Slot>,
    ) -> Self {
        Self {
            shared,
            meta,
            mail_from,
            policies: Arc::new(policies),
            recipients: Vec::new(),
            by_domain: AHashMap::new(),
            connections: Vec::new(),
            msg_slot,
        }
    }

    async fn run_workers(
        &mut self,
        collector: &dyn StatusCollector,
        header: &MessageHeader,
        body: &MessageBody,
    ) {
        if self.meta.quarantine {
            for rcpt in &self.recipients {
                collector.set_status(
                    rcpt,
                    Err(Status::new(
                        550,
                        EnhancedCode(5, 7, 0),
                        "Refusing to deliver a quarantined message",
                    )),
                );
            }
            return;
        }

        debug!(
            message = self.meta.id,
            domains = self.by_domain.len(),
            "starting per-domain delivery"
        );

        let mut workers = JoinSet::new();
        let mut pending: HashMap<tokio::task::Id, Vec<String>> = HashMap::new();

        for (domain, rcpts) in self.by_domain.drain() {
            let shared = Arc::clone(&self.shared);
            let policies = Arc::clone(&self.policies);
            let message_id = self.meta.id.clone();
            let mail_from = self.mail_from.clone();
            let header = header.clone();
            let body = body.clone();
            let worker_rcpts = rcpts.clone();

            let handle = workers.spawn(async move {
                deliver_domain(
                    shared,
                    policies,
                    message_id,
                    mail_from,
                    domain,
                    worker_rcpts,
                    header,
                    body,
                )
                .await
            });
            pending.insert(handle.id(), rcpts);
        }

        while let Some(joined) = workers.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    pending.remove(&id);
                    for (rcpt, result) in outcome.statuses {
                        collector.set_status(&rcpt, result);
                    }
                    if let Some(conn) = outcome.conn {
                        self.connections.push(conn);
                    }
                }
                Err(err) => {
                    // a crashed worker must not strand its recipients
                    if let Some(rcpts) = pending.remove(&err.id()) {
                        for rcpt in rcpts {
                            collector.set_status(
                                &rcpt,
                                Err(Status::new(
                                    451,
                                    EnhancedCode(4, 0, 0),
                                    "Internal error during delivery",
                                )),
                            );
                        }
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        let reuse_limit = self.shared.config.conn_reuse_limit;
        let command_timeout = self.shared.config.timeouts.command();

        for mut conn in self.connections.drain(..) {
            drop(conn.dest_slot.take());
            conn.transactions += 1;

            if conn.usable(reuse_limit) {
                debug!(
                    message = self.meta.id,
                    domain = %conn.domain,
                    mx = %conn.mx_host,
                    transactions = conn.transactions,
                    "returning connection to the pool"
                );
                let key = conn.domain.clone();
                if let Some(refused) = self.shared.pool.put(&key, conn) {
                    refused.quit_best_effort(command_timeout).await;
                }
            } else {
                debug!(
                    message = self.meta.id,
                    domain = %conn.domain,
                    mx = %conn.mx_host,
                    errored = conn.errored,
                    transactions = conn.transactions,
                    "closing connection"
                );
                conn.quit_best_effort(command_timeout).await;
            }
        }

        drop(self.msg_slot.take());
    }
}

#[async_trait]
impl Transaction for Delivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), Status> {
        if self.meta.quarantine {
            return Err(Status::new(
                550,
                EnhancedCode(5, 7, 0),
                "Refusing to deliver a quarantined message",
            ));
        }

        let (_, domain) = address::split(rcpt).map_err(|_| {
            Status::new(553, EnhancedCode(5, 1, 3), "Malformed recipient address")
        })?;
        if domain.is_empty() {
            return Err(Status::new(
                550,
                EnhancedCode(5, 1, 1),
                "Bare postmaster address is not supported",
            ));
        }

        self.by_domain
            .entry(Domain::new(domain))
            .or_default()
            .push(rcpt.to_owned());
        self.recipients.push(rcpt.to_owned());
        Ok(())
    }

    async fn body(&mut self, header: &MessageHeader, body: &MessageBody) -> Result<(), Status> {
        let collector = StatusMap::new();
        self.run_workers(&collector, header, body).await;
        aggregate(collector.into_inner())
    }

    async fn body_non_atomic(
        &mut self,
        collector: &dyn StatusCollector,
        header: &MessageHeader,
        body: &MessageBody,
    ) {
        self.run_workers(collector, header, body).await;
    }

    async fn commit(mut self: Box<Self>) -> Result<(), Status> {
        // nothing to finalize across remote hosts; settle resources
        self.close().await;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        self.close().await;
    }
}

struct DomainOutcome {
    statuses: Vec<(String, Result<(), Status>)>,
    conn: Option<MxConn>,
}

fn fail_all(outcome: &mut DomainOutcome, rcpts: &[String], status: &Status) {
    for rcpt in rcpts {
        outcome.statuses.push((rcpt.clone(), Err(status.clone())));
    }
}

#[allow(
    clippy::too_many_arguments,
    reason = "one invocation carries the whole per-domain job"
)]
async fn deliver_domain(
    shared: Arc<TargetInner>,
    policies: Arc<Vec<Box<dyn DeliveryPolicy>>>,
    message_id: String,
    mail_from: String,
    domain: Domain,
    rcpts: Vec<String>,
    header: MessageHeader,
    body: MessageBody,
) -> DomainOutcome {
    let mut outcome = DomainOutcome {
        statuses: Vec::with_capacity(rcpts.len()),
        conn: None,
    };
    let key = domain.as_str();
    let timeouts = shared.config.timeouts;

    let Some(dest_slot) = shared.limits.take_domain(key).await else {
        fail_all(
            &mut outcome,
            &rcpts,
            &Status::new(451, EnhancedCode(4, 4, 5), "High load, try again later"),
        );
        return outcome;
    };

    let records = match shared.resolver.resolve_mx(key).await {
        Ok((records, cache_hit)) => {
            debug!(
                message = message_id,
                domain = key,
                exchangers = records.len(),
                cache_hit,
                "resolved mail exchangers"
            );
            records
        }
        Err(err) => {
            fail_all(&mut outcome, &rcpts, &Status::from(err));
            return outcome;
        }
    };

    let fast_target = match shared.resolver.resolve(key) {
        Ok(Some(target)) => target,
        Ok(None) => key.to_owned(),
        Err(err) => {
            debug!(message = message_id, domain = key, error = %err, "override read failed");
            key.to_owned()
        }
    };
    match shared
        .fastpath
        .attempt(&fast_target, &mail_from, &rcpts, &header, &body)
        .await
    {
        FastPathOutcome::Delivered => {
            debug!(message = message_id, domain = key, "direct transfer delivered");
            for rcpt in rcpts {
                outcome.statuses.push((rcpt, Ok(())));
            }
            return outcome;
        }
        FastPathOutcome::Skipped | FastPathOutcome::Fallback => {}
    }

    if let Err(status) = policy::check_mx(&policies, key, &records).await {
        fail_all(&mut outcome, &rcpts, &status);
        return outcome;
    }

    let mut conn = match checkout(&shared, &policies, &domain, &records).await {
        Ok(conn) => conn,
        Err(status) => {
            fail_all(&mut outcome, &rcpts, &status);
            return outcome;
        }
    };
    conn.dest_slot = Some(dest_slot);

    match with_timeout(timeouts.command(), conn.client.mail_from(&mail_from)).await {
        Ok(response) if response.is_success() => {}
        Ok(response) => {
            fail_all(&mut outcome, &rcpts, &response.to_status());
            outcome.conn = Some(conn);
            return outcome;
        }
        Err(err) => {
            conn.errored = true;
            fail_all(&mut outcome, &rcpts, &Status::from(err));
            outcome.conn = Some(conn);
            return outcome;
        }
    }

    let mut accepted = Vec::with_capacity(rcpts.len());
    for rcpt in &rcpts {
        match with_timeout(timeouts.command(), conn.client.rcpt_to(rcpt)).await {
            Ok(response) if response.is_success() => accepted.push(rcpt.clone()),
            Ok(response) => {
                debug!(
                    message = message_id,
                    domain = key,
                    rcpt,
                    code = response.code,
                    "recipient refused"
                );
                outcome.statuses.push((rcpt.clone(), Err(response.to_status())));
            }
            Err(err) => {
                conn.errored = true;
                outcome.statuses.push((rcpt.clone(), Err(Status::from(err))));
            }
        }
    }

    if accepted.is_empty() {
        outcome.conn = Some(conn);
        return outcome;
    }

    let verdict = transmit(&mut conn, &timeouts, &header, &body).await;
    match verdict {
        Ok(()) => {
            for rcpt in accepted {
                outcome.statuses.push((rcpt, Ok(())));
            }
        }
        Err(status) => {
            conn.errored = true;
            for rcpt in accepted {
                outcome.statuses.push((rcpt, Err(status.clone())));
            }
        }
    }

    conn.last_use = Instant::now();
    outcome.conn = Some(conn);
    outcome
}

async fn transmit(
    conn: &mut MxConn,
    timeouts: &crate::config::TimeoutConfig,
    header: &MessageHeader,
    body: &MessageBody,
) -> Result<(), Status> {
    let go_ahead = with_timeout(timeouts.command(), conn.client.data())
        .await
        .map_err(Status::from)?;
    if !go_ahead.is_intermediate() {
        return Err(go_ahead.to_status());
    }

    let payload = header.assemble(body);
    let verdict = with_timeout(timeouts.data(), conn.client.send_payload(&payload))
        .await
        .map_err(Status::from)?;
    if !verdict.is_success() {
        return Err(verdict.to_status());
    }

    Ok(())
}

/// Takes a live pooled session for the domain or opens a new one.
///
/// Pooled sessions are probed with RSET before reuse and re-judged by this
/// message's policy chain; a chain rejection puts the (healthy) session
/// back for other messages.
async fn checkout(
    shared: &Arc<TargetInner>,
    chain: &[Box<dyn DeliveryPolicy>],
    domain: &Domain,
    records: &[crate::resolver::MxRecord],
) -> Result<MxConn, Status> {
    let key = domain.as_str();
    let command_timeout = shared.config.timeouts.command();

    while let Some(mut conn) = shared.pool.get(key) {
        match with_timeout(command_timeout, conn.client.rset()).await {
            Ok(response) if response.is_success() => {}
            _ => {
                debug!(domain = key, mx = %conn.mx_host, "pooled connection is dead, discarding");
                continue;
            }
        }

        if let Err(status) =
            policy::check_connection(chain, key, &conn.mx_host, conn.security).await
        {
            if let Some(refused) = shared.pool.put(key, conn) {
                refused.quit_best_effort(command_timeout).await;
            }
            return Err(status);
        }

        debug!(domain = key, mx = %conn.mx_host, "reusing pooled connection");
        return Ok(conn);
    }

    connect::open_connection(&shared.config, chain, key, records).await
}

/// Folds per-recipient outcomes into the transaction-level status.
///
/// A single-recipient transaction surfaces that recipient's error
/// untouched. A partial multi-recipient failure collapses to one
/// composite status, classified temporary when any contributing failure
/// is, so the sender retries rather than dropping mail (at the price of
/// possible duplicates for recipients that already succeeded).
fn aggregate(statuses: HashMap<String, Result<(), Status>>) -> Result<(), Status> {
    let mut failures = 0usize;
    let mut any_temporary = false;
    let mut last_error = None;

    for result in statuses.values() {
        if let Err(status) = result {
            failures += 1;
            any_temporary |= status.is_temporary();
            last_error = Some(status.clone());
        }
    }

    if failures == 0 {
        return Ok(());
    }

    if statuses.len() == 1 {
        if let Some(status) = last_error {
            return Err(status);
        }
    }

    let (code, enhanced) = if any_temporary {
        (451, EnhancedCode(4, 0, 0))
    } else {
        (550, EnhancedCode(5, 0, 0))
    };
    Err(Status::new(
        code,
        enhanced,
        "Partial delivery failure, additional attempts may result in duplicates",
    ))
}
