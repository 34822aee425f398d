use crate::logistics::paginate;
use crate::models::StageReport;
use crate::notify::Notifier;
use crate::pipeline::{Pipeline, PipelineError};
use crate::run_lock::{RedisRunLock, RunLocks};
use crate::wb::ApiToken;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What a run produced and where it went.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub run_id: Uuid,
    pub seller_id: i64,
    pub date: NaiveDate,
    pub has_changes: bool,
    pub chunks: Vec<String>,
    pub chat_id: Option<i64>,
    pub delivered: usize,
    pub stages: Vec<StageReport>,
}

/// Runs the pipeline for a stored seller and hands the pages to the chat.
#[derive(Clone)]
pub struct ReportDispatcher {
    pipeline: Pipeline,
    notifier: Arc<dyn Notifier>,
    locks: RunLocks,
    redis: Option<RedisRunLock>,
}

impl ReportDispatcher {
    pub fn new(pipeline: Pipeline, notifier: Arc<dyn Notifier>, redis: Option<RedisRunLock>) -> Self {
        Self {
            pipeline,
            notifier,
            locks: RunLocks::default(),
            redis,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run and deliver. `Ok(None)` when another replica is already running
    /// this seller.
    pub async fn dispatch(&self, seller_id: i64) -> Result<Option<Delivery>, PipelineError> {
        self.execute(seller_id, true).await
    }

    /// Run without sending anything to the chat.
    pub async fn preview(&self, seller_id: i64) -> Result<Option<Delivery>, PipelineError> {
        self.execute(seller_id, false).await
    }

    async fn execute(&self, seller_id: i64, deliver: bool) -> Result<Option<Delivery>, PipelineError> {
        let seller = self
            .pipeline
            .store()
            .find_seller(seller_id)
            .await
            .map_err(|err| PipelineError::internal("load_seller", err.to_string()))?
            .ok_or_else(|| PipelineError::not_found("load_seller", format!("seller {seller_id} not found")))?;
        check_credential(&seller.api_token)?;

        let _local = self.locks.acquire(seller_id).await;
        let owner = Uuid::new_v4().to_string();
        if let Some(redis) = &self.redis {
            match redis.try_acquire(seller_id, &owner).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        target = "logistics_watch.dispatch",
                        seller_id, "run already in progress elsewhere; skipping"
                    );
                    return Ok(None);
                }
                Err(err) => warn!(
                    target = "logistics_watch.dispatch",
                    seller_id,
                    error = %err,
                    "distributed lock unavailable; relying on local lock"
                ),
            }
        }

        let result = self.run_and_deliver(seller_id, &seller.api_token, deliver).await;

        if let Some(redis) = &self.redis
            && let Err(err) = redis.release(seller_id, &owner).await
        {
            warn!(target = "logistics_watch.dispatch", seller_id, error = %err, "failed to release run lock");
        }
        result.map(Some)
    }

    async fn run_and_deliver(
        &self,
        seller_id: i64,
        api_token: &str,
        deliver: bool,
    ) -> Result<Delivery, PipelineError> {
        let outcome = self.pipeline.run(seller_id, api_token).await?;
        let chunks = paginate(outcome.report.text(), self.pipeline.config.max_message_chars);

        let chat_id = self
            .pipeline
            .store()
            .chat_id_for_seller(seller_id)
            .await
            .map_err(|err| PipelineError::internal("deliver", err.to_string()))?;

        let mut delivered = 0;
        if deliver {
            match chat_id {
                Some(chat_id) => {
                    for chunk in chunks.iter().filter(|chunk| !chunk.trim().is_empty()) {
                        self.notifier.send_text(chat_id, chunk).await.map_err(|err| {
                            error!(
                                target = "logistics_watch.dispatch",
                                seller_id,
                                chat_id,
                                delivered,
                                error = %err,
                                "report delivery failed"
                            );
                            PipelineError::internal("deliver", err.to_string())
                        })?;
                        delivered += 1;
                    }
                }
                None => warn!(
                    target = "logistics_watch.dispatch",
                    seller_id, "seller has no chat; report not delivered"
                ),
            }
        }
        crate::metrics::messages_sent(delivered);

        Ok(Delivery {
            run_id: outcome.run_id,
            seller_id,
            date: outcome.date,
            has_changes: outcome.report.has_changes(),
            chunks,
            chat_id,
            delivered,
            stages: outcome.stages,
        })
    }
}

/// Reject tokens that cannot be decoded or have expired.
pub fn check_credential(api_token: &str) -> Result<ApiToken, PipelineError> {
    let token = ApiToken::decode(api_token)
        .map_err(|err| PipelineError::credential("check_credential", err.to_string()))?;
    if token.is_expired(Utc::now()) {
        return Err(PipelineError::credential(
            "check_credential",
            format!("token expired at {}", token.expires_at.to_rfc3339()),
        ));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::pipeline::{PipelineErrorKind, tests::fixture};
    use crate::store::{MemoryStore, NewUser, Store};
    use crate::wb::token::encode_test_token;
    use chrono::Duration;
    use serde_json::json;

    fn valid_token() -> String {
        encode_test_token(&json!({ "exp": (Utc::now() + Duration::days(90)).timestamp(), "s": 1 << 5 }))
    }

    async fn seller_with_chat(store: &MemoryStore, token: &str) -> i64 {
        let user = store
            .insert_user(&NewUser {
                user_tg_id: 4242,
                username: Some("shop".into()),
                first_name: None,
                last_name: None,
            })
            .await
            .expect("user");
        store.upsert_seller(user.id, token).await.expect("seller").id
    }

    #[tokio::test]
    async fn unknown_seller_is_not_found() {
        let (pipeline, _store, _api) = fixture().await;
        let dispatcher = ReportDispatcher::new(pipeline, Arc::new(RecordingNotifier::default()), None);
        let err = dispatcher.dispatch(99).await.expect_err("missing");
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
    }

    #[tokio::test]
    async fn expired_token_is_rejected_before_running() {
        let (pipeline, store, _api) = fixture().await;
        let expired = encode_test_token(&json!({ "exp": 1_600_000_000 }));
        let seller_id = seller_with_chat(&store, &expired).await;
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = ReportDispatcher::new(pipeline, notifier.clone(), None);
        let err = dispatcher.dispatch(seller_id).await.expect_err("expired");
        assert_eq!(err.kind(), PipelineErrorKind::Credential);
        assert_eq!(err.stage(), "check_credential");
        assert!(notifier.sent.lock().await.is_empty());
        assert!(store.stock_rows().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_token_is_a_credential_error() {
        let err = check_credential("garbage").expect_err("malformed");
        assert_eq!(err.kind(), PipelineErrorKind::Credential);
    }

    #[tokio::test]
    async fn delivers_every_page_to_the_sellers_chat() {
        let (pipeline, store, _api) = fixture().await;
        let seller_id = seller_with_chat(&store, &valid_token()).await;
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = ReportDispatcher::new(pipeline, notifier.clone(), None);
        let delivery = dispatcher
            .dispatch(seller_id)
            .await
            .expect("dispatch")
            .expect("not skipped");
        let sent = notifier.sent.lock().await;
        assert_eq!(delivery.delivered, sent.len());
        assert_eq!(delivery.chat_id, Some(4242));
        assert!(sent.iter().all(|(chat, _)| *chat == 4242));
        assert_eq!(
            sent.iter().map(|(_, text)| text.as_str()).collect::<Vec<_>>(),
            delivery.chunks.iter().map(String::as_str).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn preview_sends_nothing() {
        let (pipeline, store, _api) = fixture().await;
        let seller_id = seller_with_chat(&store, &valid_token()).await;
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = ReportDispatcher::new(pipeline, notifier.clone(), None);
        let delivery = dispatcher
            .preview(seller_id)
            .await
            .expect("preview")
            .expect("not skipped");
        assert_eq!(delivery.delivered, 0);
        assert!(!delivery.chunks.is_empty());
        assert!(notifier.sent.lock().await.is_empty());
    }
}
