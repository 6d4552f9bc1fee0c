use bytes::Bytes;
use parking_lot::RwLock;
use rand::RngExt;
use relay_core::{
    ErrorCode, ProviderError, RelayError, RequestContext, Result, RouteTarget, Scenario,
};
use relay_pool::{EndpointGroupManager, ModelPool};
use relay_stream::{ByteStream, EventMapFn, ReissueFn, SseEvent, StreamManager, StreamOptions};
use relay_transform::{TransformerChain, TransformerRegistry};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_config::RelayConfig;

use crate::registry::{Provider, ProviderRegistry};
use crate::router::{IngressMeta, Router};
use crate::selector::ModelSelector;
use crate::upstream::{Upstream, UpstreamReply};

/// How long a race candidate's reservation may sit unconfirmed.
const RESERVE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the dispatcher hands back to the HTTP layer.
#[derive(Debug)]
pub enum DispatchOutcome {
    Json(Value),
    /// A pumped SSE byte stream; dropping the receiver signals client
    /// disconnect.
    Stream(mpsc::Receiver<io::Result<Bytes>>),
}

/// One finished request, for the metrics collector.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub scenario: Scenario,
    pub success: bool,
    pub http_status: u16,
    pub latency_ms: u64,
    pub had_failover: bool,
    pub failover_attempts: u32,
    pub raced: bool,
    pub streamed: bool,
    pub timestamp_ms: i64,
}

/// Sink for finished-request records. The server's tracker implements this.
pub trait RequestObserver: Send + Sync {
    fn record(&self, record: RequestRecord);
}

/// Admission held on the model slot and, when endpoint limiting is enabled,
/// the endpoint slot. Both layers release together on every exit path; a
/// drop without an explicit outcome releases without health blame.
struct Admission {
    pool: Arc<ModelPool>,
    endpoints: Arc<EndpointGroupManager>,
    target: RouteTarget,
    endpoint: Option<(String, String)>,
    done: bool,
}

impl Admission {
    fn finish(&mut self, success: bool) {
        if self.done {
            return;
        }
        self.done = true;
        self.pool.release_slot(&self.target, success);
        if let Some((base, provider)) = &self.endpoint {
            self.endpoints.release_slot(base, provider, success);
        }
    }

    fn finish_uncounted(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.pool.release_slot_uncounted(&self.target);
        if let Some((base, provider)) = &self.endpoint {
            self.endpoints.release_slot_uncounted(base, provider);
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.finish_uncounted();
    }
}

enum RaceMessage {
    Won(RouteTarget, DispatchOutcome),
    Lost(RouteTarget, RelayError),
    Skipped(RouteTarget),
}

/// The single entry point for request dispatch: routing decision, slot
/// admission (or queueing), optional parallel racing, the upstream call with
/// transformation, and post-hoc failover for the custom-model alias.
pub struct Dispatcher {
    config: Arc<RwLock<RelayConfig>>,
    pool: Arc<ModelPool>,
    endpoints: Arc<EndpointGroupManager>,
    registry: Arc<ProviderRegistry>,
    transformers: Arc<TransformerRegistry>,
    upstream: Arc<dyn Upstream>,
    observer: Option<Arc<dyn RequestObserver>>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<RwLock<RelayConfig>>,
        pool: Arc<ModelPool>,
        endpoints: Arc<EndpointGroupManager>,
        registry: Arc<ProviderRegistry>,
        upstream: Arc<dyn Upstream>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            endpoints,
            registry,
            transformers: Arc::new(TransformerRegistry::with_defaults()),
            upstream,
            observer: None,
        })
    }

    pub fn with_observer(mut self: Arc<Self>, observer: Arc<dyn RequestObserver>) -> Arc<Self> {
        let this = Arc::get_mut(&mut self).expect("with_observer before sharing");
        this.observer = Some(observer);
        self
    }

    pub fn pool(&self) -> &Arc<ModelPool> {
        &self.pool
    }

    pub fn endpoints(&self) -> &Arc<EndpointGroupManager> {
        &self.endpoints
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Handle one ingress request end to end.
    pub async fn handle(
        self: &Arc<Self>,
        body: Value,
        meta: IngressMeta,
    ) -> Result<DispatchOutcome> {
        let started = Instant::now();
        let config = self.config.read().clone();
        let mut ctx = Router::route(&config, &body, &meta)?;

        let decision = ModelSelector::select(
            &self.pool,
            &config.model_selector,
            &ctx.target,
            &ctx.alternatives,
            ctx.scenario,
            ctx.priority,
        );
        // A non-primary selection is adopted proactively only under
        // priority_failover; otherwise the primary is abandoned only once it
        // stops being admissible.
        if config.model_pool.priority_failover || !self.pool.has_capacity(&ctx.target) {
            ctx.target = decision.selected.clone();
        }
        ctx.should_race = decision.should_race;
        ctx.race_candidates = decision.race_candidates.clone();

        if ctx.should_race {
            let mut candidates = vec![ctx.target.clone()];
            candidates.extend(ctx.race_candidates.iter().cloned());
            let result = self.run_race(&config, &ctx, &meta, &body, candidates).await;
            return self.finish(&ctx, &meta, started, result, true, false, 0);
        }

        match self.single_path(&config, &mut ctx, &meta, &body).await {
            Ok(outcome) => {
                let winner = ctx.target.clone();
                self.finish(&ctx, &meta, started, Ok((winner, outcome)), false, false, 0)
            }
            Err(err) => {
                // Failover applies only to custom-model dispatch, and only
                // for the failover-eligible error set.
                if ctx.is_custom_model && failover_eligible(&err) {
                    let remaining: Vec<RouteTarget> = ctx
                        .alternatives
                        .iter()
                        .filter(|a| **a != ctx.target)
                        .cloned()
                        .collect();
                    let admissible = self.pool.available_alternatives(&remaining);
                    if !admissible.is_empty() {
                        warn!(
                            request_id = %ctx.request_id,
                            failed = %ctx.target,
                            alternatives = admissible.len(),
                            error = %err,
                            "primary failed, racing alternatives"
                        );
                        let result =
                            self.run_race(&config, &ctx, &meta, &body, admissible).await;
                        // One failover round, however many candidates raced.
                        return self.finish(&ctx, &meta, started, result, false, true, 1);
                    }
                }
                self.finish(
                    &ctx,
                    &meta,
                    started,
                    Err(err),
                    false,
                    false,
                    0,
                )
            }
        }
    }

    /// Record the outcome and unwrap it for the caller.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        ctx: &RequestContext,
        meta: &IngressMeta,
        started: Instant,
        result: Result<(RouteTarget, DispatchOutcome)>,
        raced: bool,
        had_failover: bool,
        failover_attempts: u32,
    ) -> Result<DispatchOutcome> {
        let (success, http_status, target) = match &result {
            Ok((winner, _)) => (true, 200, winner.clone()),
            Err(e) => (false, e.http_status(), ctx.target.clone()),
        };
        if let Some(observer) = &self.observer {
            observer.record(RequestRecord {
                request_id: ctx.request_id.clone(),
                provider: target.provider.clone(),
                model: target.model.clone(),
                scenario: ctx.scenario,
                success,
                http_status,
                latency_ms: started.elapsed().as_millis() as u64,
                had_failover,
                failover_attempts,
                raced,
                streamed: meta.stream,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            });
        }
        result.map(|(_, outcome)| outcome)
    }

    /// The non-racing path: admit (or queue), call upstream, release with
    /// blame.
    async fn single_path(
        self: &Arc<Self>,
        config: &RelayConfig,
        ctx: &mut RequestContext,
        meta: &IngressMeta,
        body: &Value,
    ) -> Result<DispatchOutcome> {
        let provider = self.registry.get_enabled(&ctx.target.provider)?;
        ctx.family = provider.family;

        let admission = self.admit(&provider, ctx).await?;
        ctx.log_stage("admitted");
        self.attempt(config, provider, ctx.clone(), meta, body.clone(), admission)
            .await
    }

    /// Admit on the endpoint layer (when enabled) and the model layer,
    /// queueing with the request's priority when saturated.
    async fn admit(&self, provider: &Arc<Provider>, ctx: &RequestContext) -> Result<Admission> {
        let endpoint = if self.endpoints.enabled() {
            let base = provider.base_url.clone();
            if !self.endpoints.try_acquire(&base, &provider.name) {
                let ticket = self
                    .endpoints
                    .enqueue(&base, &provider.name, ctx.priority)?;
                ticket.wait().await?;
                self.endpoints.attribute_admission(&base, &provider.name);
            }
            Some((base, provider.name.clone()))
        } else {
            None
        };

        // Holder that releases the endpoint admission if the model layer
        // fails below.
        let mut admission = Admission {
            pool: Arc::clone(&self.pool),
            endpoints: Arc::clone(&self.endpoints),
            target: ctx.target.clone(),
            endpoint,
            done: false,
        };

        if !self.pool.try_acquire(&ctx.target) {
            // Queueing behind a rate-limited slot is futile until the
            // cooldown passes; surface the rate-limit instead so custom-model
            // dispatch can fail over.
            if self.config.read().model_pool.queue.skip_rate_limited
                && self.pool.is_rate_limited(&ctx.target)
            {
                if let Some((base, prov)) = admission.endpoint.take() {
                    self.endpoints.release_slot_uncounted(&base, &prov);
                }
                admission.done = true;
                return Err(RelayError::Provider(
                    ProviderError::new(ErrorCode::RateLimit, "slot in rate-limit cooldown", 429)
                        .retryable(false)
                        .with_provider(ctx.target.provider.clone()),
                ));
            }
            debug!(slot = %ctx.target, "slot saturated, queueing");
            let ticket = match self.pool.enqueue(&ctx.target, ctx.priority) {
                Ok(t) => t,
                Err(e) => {
                    // Only the endpoint admission is held at this point.
                    if let Some((base, prov)) = admission.endpoint.take() {
                        self.endpoints.release_slot_uncounted(&base, &prov);
                    }
                    admission.done = true;
                    return Err(e);
                }
            };
            if let Err(e) = ticket.wait().await {
                if let Some((base, prov)) = admission.endpoint.take() {
                    self.endpoints.release_slot_uncounted(&base, &prov);
                }
                admission.done = true;
                return Err(e);
            }
        }
        Ok(admission)
    }

    /// One upstream attempt with an admission already held: transform, send,
    /// wire up the response, and release the admission on every path.
    async fn attempt(
        self: &Arc<Self>,
        config: &RelayConfig,
        provider: Arc<Provider>,
        ctx: RequestContext,
        meta: &IngressMeta,
        body: Value,
        mut admission: Admission,
    ) -> Result<DispatchOutcome> {
        let ingress = self
            .transformers
            .get(meta.dialect.transformer_name())
            .ok_or_else(|| RelayError::Config("ingress transformer missing".into()))?;
        let chain = TransformerChain::assemble(
            &self.transformers,
            ingress,
            provider.transformer.as_ref(),
            &ctx.target.model,
        );
        let auth = chain.bypass_auth();

        let mut outbound = chain.transform_request(body, &ctx)?.body;
        if meta.stream
            && let Value::Object(map) = &mut outbound
        {
            map.insert("stream".into(), Value::Bool(true));
        }

        let cancel = CancellationToken::new();
        let sent = self
            .upstream
            .send(&provider, &ctx, &outbound, meta.stream, auth.clone(), &cancel)
            .await;

        match sent {
            Ok(UpstreamReply::Json(json)) => {
                let response = chain.transform_response(json, &ctx)?;
                admission.finish(true);
                Ok(DispatchOutcome::Json(response))
            }
            Ok(UpstreamReply::Stream(bytes)) => {
                Ok(self.wire_stream(config, provider, ctx, chain, outbound, bytes, admission, cancel))
            }
            Err(err) => {
                self.mark_failure_state(&provider, &ctx.target, &err);
                if err.counts_as_failure() {
                    admission.finish(false);
                } else {
                    admission.finish_uncounted();
                }
                Err(err)
            }
        }
    }

    /// Pump an upstream byte stream through the stream manager and hand the
    /// client a receiver. The admission is released when the stream ends, and
    /// client disconnect cancels the upstream.
    #[allow(clippy::too_many_arguments)]
    fn wire_stream(
        self: &Arc<Self>,
        config: &RelayConfig,
        provider: Arc<Provider>,
        ctx: RequestContext,
        chain: TransformerChain,
        outbound: Value,
        bytes: ByteStream,
        mut admission: Admission,
        cancel: CancellationToken,
    ) -> DispatchOutcome {
        let options = StreamOptions::from_config(&config.streaming, ctx.scenario);

        // The reconnect closure re-issues the upstream call with the already
        // transformed body; headers and signature are rebuilt per attempt.
        let reissue: ReissueFn = {
            let upstream = Arc::clone(&self.upstream);
            let provider = Arc::clone(&provider);
            let ctx = ctx.clone();
            let outbound = outbound.clone();
            let cancel = cancel.clone();
            let auth = chain.bypass_auth();
            Box::new(move || {
                let upstream = Arc::clone(&upstream);
                let provider = Arc::clone(&provider);
                let ctx = ctx.clone();
                let outbound = outbound.clone();
                let cancel = cancel.clone();
                let auth = auth.clone();
                Box::pin(async move {
                    match upstream
                        .send(&provider, &ctx, &outbound, true, auth, &cancel)
                        .await?
                    {
                        UpstreamReply::Stream(fresh) => Ok(fresh),
                        UpstreamReply::Json(_) => Err(RelayError::Stream(
                            "reissued upstream did not stream".into(),
                        )),
                    }
                })
            })
        };

        // Dialect rewrite per event, unless the chain is bypassed.
        let map_event: Option<EventMapFn> = if chain.is_bypass() {
            None
        } else {
            let event_ctx = ctx.clone();
            Some(Box::new(move |event| match event {
                SseEvent::Data { event: name, data } => {
                    match serde_json::from_str::<Value>(&data) {
                        Ok(json) => match chain.transform_event(json, &event_ctx) {
                            Ok(mapped) => Some(SseEvent::Data {
                                event: name,
                                data: mapped.to_string(),
                            }),
                            Err(_) => None,
                        },
                        // Non-JSON payloads pass through untouched.
                        Err(_) => Some(SseEvent::Data { event: name, data }),
                    }
                }
                other => Some(other),
            }))
        };

        let staggered_target = ctx.target.clone();
        let on_staggered: Box<dyn FnOnce() + Send> = Box::new(move || {
            warn!(slot = %staggered_target, "staggered stream detected");
        });

        let pump_rx = StreamManager::pump(
            bytes,
            Some(reissue),
            options,
            cancel.clone(),
            map_event,
            Some(on_staggered),
        );

        // Forwarding hop: observes the stream end to release the admission,
        // and turns a dropped client receiver into upstream cancellation.
        let (out_tx, out_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut pump_rx = pump_rx;
            while let Some(item) = pump_rx.recv().await {
                if out_tx.send(item).await.is_err() {
                    debug!("client receiver dropped, cancelling upstream");
                    cancel.cancel();
                    break;
                }
            }
            admission.finish(true);
        });

        DispatchOutcome::Stream(out_rx)
    }

    /// Propagate failure state into the pools: rate-limit errors put the slot
    /// (and endpoint, when enabled) into cooldown.
    fn mark_failure_state(&self, provider: &Provider, target: &RouteTarget, err: &RelayError) {
        if let RelayError::Provider(pe) = err
            && pe.code.is_rate_limit()
        {
            let retry_after = pe.retry_after.map(Duration::from_secs);
            self.pool.mark_rate_limit(target, retry_after);
            if self.endpoints.enabled() {
                self.endpoints.mark_rate_limit(&provider.base_url, retry_after);
            }
        }
    }

    /// Race candidates concurrently; first success wins and cancels the rest.
    async fn run_race(
        self: &Arc<Self>,
        config: &RelayConfig,
        base_ctx: &RequestContext,
        meta: &IngressMeta,
        body: &Value,
        candidates: Vec<RouteTarget>,
    ) -> Result<(RouteTarget, DispatchOutcome)> {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(candidates.len().max(1));
        let mut spawned = 0usize;

        for target in candidates {
            let provider = match self.registry.get_enabled(&target.provider) {
                Ok(p) => p,
                Err(_) => continue,
            };
            // Iflow-family racers must not share a provider-side session.
            let suffix = format!("{:08x}", rand::rng().random::<u32>());
            let cctx = base_ctx.for_candidate(target.clone(), provider.family, Some(&suffix));

            let this = Arc::clone(self);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let config = config.clone();
            let meta = meta.clone();
            let body = body.clone();
            spawned += 1;

            tokio::spawn(async move {
                let reservation = uuid::Uuid::new_v4().to_string();
                if !this
                    .pool
                    .reserve_slot(&cctx.target, RESERVE_TIMEOUT, &reservation)
                {
                    let _ = tx.send(RaceMessage::Skipped(cctx.target.clone())).await;
                    return;
                }
                this.pool.confirm_slot(&cctx.target, &reservation);

                let endpoint = if this.endpoints.enabled() {
                    let base = provider.base_url.clone();
                    if !this.endpoints.try_acquire(&base, &provider.name) {
                        this.pool.release_slot_uncounted(&cctx.target);
                        let _ = tx.send(RaceMessage::Skipped(cctx.target.clone())).await;
                        return;
                    }
                    Some((base, provider.name.clone()))
                } else {
                    None
                };

                let admission = Admission {
                    pool: Arc::clone(&this.pool),
                    endpoints: Arc::clone(&this.endpoints),
                    target: cctx.target.clone(),
                    endpoint,
                    done: false,
                };

                let target = cctx.target.clone();
                let race_cancelled = tokio::select! {
                    _ = cancel.cancelled() => true,
                    result = this.attempt(&config, provider, cctx, &meta, body, admission) => {
                        match result {
                            Ok(outcome) => {
                                if tx.send(RaceMessage::Won(target.clone(), outcome)).await.is_err() {
                                    // Completed after another candidate won:
                                    // the upstream work succeeded, so the
                                    // release (already done inside attempt)
                                    // counted it as a success; the response
                                    // is simply discarded.
                                    debug!(slot = %target, "race result discarded");
                                }
                                false
                            }
                            Err(e) => {
                                let _ = tx.send(RaceMessage::Lost(target.clone(), e)).await;
                                false
                            }
                        }
                    }
                };
                if race_cancelled {
                    debug!(slot = %target, "race candidate cancelled");
                }
            });
        }
        drop(tx);

        if spawned == 0 {
            return Err(RelayError::AllAttemptsFailed(
                "no admissible candidates".into(),
            ));
        }

        let mut failures: Vec<String> = Vec::new();
        while let Some(message) = rx.recv().await {
            match message {
                RaceMessage::Won(target, outcome) => {
                    info!(winner = %target, "race won");
                    cancel.cancel();
                    return Ok((target, outcome));
                }
                RaceMessage::Lost(target, err) => {
                    failures.push(format!("{target}: {err}"));
                }
                RaceMessage::Skipped(target) => {
                    failures.push(format!("{target}: no capacity"));
                }
            }
        }
        Err(RelayError::AllAttemptsFailed(failures.join("; ")))
    }
}

fn failover_eligible(err: &RelayError) -> bool {
    match err {
        RelayError::Provider(pe) => pe.failover_eligible(),
        _ => false,
    }
}
