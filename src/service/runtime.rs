//! Consumer loop and worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{CommonService, ServiceContext};
use crate::config::DlstbxConfig;
use crate::logging::{log_error, log_message_outcome};
use crate::messaging::{subscribe, Delivery, SubscriptionSettings};

/// How a service run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceExit {
    Stopped,
    TerminationRequested,
}

impl ServiceExit {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Stopped => 0,
            Self::TerminationRequested => 1,
        }
    }
}

#[derive(Debug)]
pub struct ServiceRuntime {
    service: Arc<dyn CommonService>,
    context: ServiceContext,
    settings: SubscriptionSettings,
    workers: usize,
    shutdown_timeout: Duration,
}

impl ServiceRuntime {
    pub fn new(
        service: Arc<dyn CommonService>,
        context: ServiceContext,
        config: &DlstbxConfig,
    ) -> Self {
        Self {
            service,
            context,
            settings: SubscriptionSettings::from(&config.transport),
            workers: config.service.workers.max(1),
            shutdown_timeout: Duration::from_secs(config.service.shutdown_timeout_seconds),
        }
    }

    pub fn context(&self) -> &ServiceContext {
        &self.context
    }

    /// Consume until stopped or until a handler requests termination
    pub async fn run(&self) -> crate::error::Result<ServiceExit> {
        let name = self.service.name();
        let queue = self.service.queue();

        self.service.initializing(&self.context).await?;
        let mut subscription = subscribe(
            self.context.transport().clone(),
            &queue,
            self.service.acknowledgement(),
            self.settings.clone(),
        )
        .await?;

        info!(
            service = name,
            queue = %queue,
            workers = self.workers,
            transport = self.context.transport().provider_name(),
            "Service started"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        loop {
            let permit = tokio::select! {
                _ = self.context.stopped() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let delivery = tokio::select! {
                _ = self.context.stopped() => break,
                delivery = subscription.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        warn!(service = name, queue = %queue, "Subscription closed");
                        break;
                    }
                },
            };

            let service = self.service.clone();
            let context = self.context.clone();
            tokio::spawn(async move {
                dispatch_delivery(service.as_ref(), &context, delivery).await;
                drop(permit);
            });
        }

        subscription.unsubscribe().await;
        let in_flight = u32::try_from(self.workers).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.shutdown_timeout, semaphore.acquire_many(in_flight)).await
        {
            Ok(Ok(_)) => debug!(service = name, "In-flight messages finished"),
            _ => warn!(
                service = name,
                timeout_seconds = self.shutdown_timeout.as_secs(),
                "In-flight messages still running at shutdown"
            ),
        }

        let exit = if self.context.termination_requested() {
            ServiceExit::TerminationRequested
        } else {
            ServiceExit::Stopped
        };
        info!(service = name, exit = ?exit, "Service stopped");
        Ok(exit)
    }
}

/// Run the handler for one delivery and settle failures
///
/// Returns true if the handler succeeded.
pub async fn dispatch_delivery(
    service: &dyn CommonService,
    context: &ServiceContext,
    delivery: Delivery,
) -> bool {
    let header = delivery.header.clone();
    let span = info_span!(
        "message",
        service = service.name(),
        queue = %header.queue,
        message_id = header.message_id,
        redelivered = header.redelivered,
    );

    async move {
        let error = match service.on_message(context, delivery).await {
            Ok(()) => {
                log_message_outcome(service.name(), &header.queue, header.message_id, "handled", None);
                return true;
            }
            Err(e) => e,
        };

        let malformed = error.is_malformed();
        let details = error.to_string();
        if malformed {
            warn!(error = %error, "Rejecting malformed message");
            log_message_outcome(service.name(), &header.queue, header.message_id, "rejected", Some(&details));
        } else {
            log_error(service.name(), "on_message", &details, Some(&header.queue));
        }

        if service.acknowledgement() {
            if let Err(e) = context.transport().nack(&header, None).await {
                warn!(error = %e, "Could not nack failed message");
            }
        }
        if !malformed && service.terminate_on_failure() {
            context.request_termination(&error.to_string());
        }
        false
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::database::StoreError;
    use crate::messaging::{InMemoryTransport, Transport};
    use crate::service::ServiceError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[derive(Debug, Default)]
    struct RecordingService {
        seen: Mutex<Vec<Value>>,
        terminate: bool,
    }

    #[async_trait]
    impl CommonService for RecordingService {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn queue(&self) -> String {
            "work".to_string()
        }

        fn terminate_on_failure(&self) -> bool {
            self.terminate
        }

        async fn on_message(
            &self,
            context: &ServiceContext,
            delivery: Delivery,
        ) -> crate::error::Result<()> {
            self.seen.lock().push(delivery.message.clone());
            match delivery.message["kind"].as_str() {
                Some("malformed") => Err(ServiceError::malformed("bad body").into()),
                Some("broken") => Err(StoreError::transient("write", "lost connection").into()),
                _ => {
                    context.transport().ack(&delivery.header, None).await?;
                    Ok(())
                }
            }
        }
    }

    async fn deliver(transport: &InMemoryTransport, message: Value) -> Delivery {
        transport.send("work", message, None, None).await.unwrap();
        transport
            .receive("work", 1, Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0)
    }

    fn context(transport: Arc<InMemoryTransport>) -> ServiceContext {
        ServiceContext::new(transport, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_malformed_message_is_nacked_without_termination() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = context(transport.clone());
        let service = RecordingService {
            terminate: true,
            ..Default::default()
        };

        let delivery = deliver(&transport, json!({"kind": "malformed"})).await;
        assert!(!dispatch_delivery(&service, &ctx, delivery).await);
        assert_eq!(transport.dead_letters("work").await.len(), 1);
        assert!(!ctx.termination_requested());
    }

    #[tokio::test]
    async fn test_handler_failure_requests_termination() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = context(transport.clone());
        let service = RecordingService {
            terminate: true,
            ..Default::default()
        };

        let delivery = deliver(&transport, json!({"kind": "broken"})).await;
        assert!(!dispatch_delivery(&service, &ctx, delivery).await);
        assert_eq!(transport.dead_letters("work").await.len(), 1);
        assert!(ctx.termination_requested());
    }

    #[tokio::test]
    async fn test_run_processes_messages_until_stopped() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = context(transport.clone());
        let service = Arc::new(RecordingService::default());

        let mut config = DlstbxConfig::default();
        config.transport.poll_interval_ms = 5;
        config.service.workers = 2;
        let runtime = ServiceRuntime::new(service.clone(), ctx.clone(), &config);

        for n in 0..5 {
            transport.send("work", json!({"n": n}), None, None).await.unwrap();
        }
        let handle = tokio::spawn(async move { runtime.run().await });

        for _ in 0..200 {
            if service.seen.lock().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ctx.stop();

        let exit = handle.await.unwrap().unwrap();
        assert_eq!(exit, ServiceExit::Stopped);
        assert_eq!(exit.exit_code(), 0);
        assert_eq!(service.seen.lock().len(), 5);
        assert_eq!(transport.queue_length("work").await, 0);
    }
}
