// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, path::Path, process::ExitCode, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use log_processor::{
    aws::{
        decode::S3MessageDecoder, lambda::LambdaInvoker, s3::S3Objects, sns::SnsNotifier,
        sqs::SqsQueue, AwsClients,
    },
    classification::sources::StaticSourceLoader,
    config::ProcessorConfig,
    destinations::s3::S3Destination,
    metrics::init_metrics,
    parsers::{json::JsonParserConfig, Registry},
    processor::RegistryClassifierBuilder,
    scaling::Scaler,
    stream::{stream_events, TriggerEvent},
};

/// Path of a JSON file holding the invocation payload.
const EVENT_FILE_VAR: &str = "LOG_PROCESSOR_EVENT_FILE";

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOG_PROCESSOR_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,aws_smithy_runtime=off,aws_config=off,{log_level}"
    );

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let metrics = match init_metrics() {
        Ok(handle) => handle,
        Err(e) => {
            error!("Error installing metrics recorder: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = match ProcessorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error reading log processor configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let trigger = match env::var(EVENT_FILE_VAR) {
        Ok(path) => TriggerEvent::from_file(Path::new(&path)).await,
        Err(_) => Ok(TriggerEvent::tick()),
    };
    let trigger = match trigger {
        Ok(trigger) => trigger,
        Err(e) => {
            error!("Error reading invocation event: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut registry = Registry::new();
    for log_type in &config.json_log_types {
        if let Err(e) = registry.register(log_type, JsonParserConfig::new(log_type).into_factory())
        {
            error!("Error registering parser: {e}");
            return ExitCode::FAILURE;
        }
    }
    let sources = match &config.sources_file {
        Some(path) => match StaticSourceLoader::from_file(path).await {
            Ok(sources) => sources,
            Err(e) => {
                error!("Error loading sources: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => StaticSourceLoader::default(),
    };
    info!(
        log_types = registry.len(),
        sources = sources.len(),
        "starting log processor"
    );

    let clients = AwsClients::from_env().await;
    let queue = Arc::new(SqsQueue::new(clients.sqs.clone(), &config.queue_url));
    let objects = Arc::new(S3Objects::new(clients.s3.clone()));
    let notifier = Arc::new(SnsNotifier::new(
        clients.sns.clone(),
        &config.notifications_topic,
    ));
    let destination = Arc::new(S3Destination::new(
        config.destination(),
        objects.clone(),
        notifier,
    ));
    let decoder = Arc::new(S3MessageDecoder::new(objects));
    let builder = Arc::new(RegistryClassifierBuilder::new(
        Arc::new(registry),
        Arc::new(sources),
    ));

    let cancel = CancellationToken::new();
    let scaler_task = config.function_name.as_deref().map(|function_name| {
        let scaler = Scaler::new(
            config.scaling(),
            queue.clone(),
            Arc::new(LambdaInvoker::new(clients.lambda.clone(), function_name)),
        );
        let cancel = cancel.clone();
        tokio::spawn(async move { scaler.run(cancel).await })
    });
    if scaler_task.is_none() {
        info!("scaling disabled, no function name configured");
    }

    let result = stream_events(
        &config.stream(),
        trigger,
        queue,
        decoder,
        destination,
        builder,
    )
    .await;

    cancel.cancel();
    if let Some(task) = scaler_task {
        if let Err(e) = task.await {
            error!("scaler task failed: {e}");
        }
    }

    info!("invocation metrics\n{}", metrics.render());

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("log processing failed: {e}");
            ExitCode::FAILURE
        }
    }
}
