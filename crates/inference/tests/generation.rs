mod common;

use futures::StreamExt;
use inference::{
    ConversationContext, EngineConfig, FinishReason, GenerationError, GenerationEvent,
    GenerationService, GenerationStream, GenerationSummary, LoadState, SamplingPolicy,
};

use common::{model_dir_with, open_ended_config, open_ended_dir, poisoned_embedding_dir};

fn service_for(dir: &std::path::Path, max_new_tokens: usize) -> GenerationService {
    GenerationService::from_config(&EngineConfig {
        model_dir: dir.to_path_buf(),
        max_new_tokens,
        warmup: false,
        ..EngineConfig::default()
    })
}

fn greeting() -> ConversationContext {
    let mut ctx = ConversationContext::new();
    ctx.user("hello");
    ctx
}

/// Renders past the tiny model's window, so the prompt gets cut to its tail.
fn question() -> ConversationContext {
    let mut ctx = ConversationContext::with_system("you are gemi.");
    ctx.remember("likes hiking");
    ctx.user("hello, what did i do?");
    ctx
}

async fn drain(mut stream: GenerationStream) -> (Vec<u32>, String, GenerationSummary) {
    let mut ids = Vec::new();
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            GenerationEvent::Token { id, text: piece } => {
                ids.push(id);
                text.push_str(&piece);
            }
            GenerationEvent::Done(summary) => {
                assert!(stream.next().await.is_none());
                return (ids, text, summary);
            }
        }
    }
    panic!("stream ended without Done");
}

#[tokio::test]
async fn greedy_replies_are_repeatable() {
    let dir = open_ended_dir(21);
    let service = service_for(dir.path(), 10);

    let first = service.generate(question(), Some(SamplingPolicy::greedy())).await.unwrap();
    let (ids_a, text_a, summary) = drain(first).await;
    let second = service.generate(question(), Some(SamplingPolicy::greedy())).await.unwrap();
    let (ids_b, text_b, _) = drain(second).await;

    assert_eq!(ids_a, ids_b);
    assert_eq!(text_a, text_b);
    assert_eq!(summary.reason, FinishReason::Length);
    assert_eq!(summary.generated_tokens, 10);
    assert!(summary.prompt_tokens > 0);
    assert_eq!(service.registry().load_count(), 1);
}

#[tokio::test]
async fn seeded_sampling_is_repeatable() {
    let dir = open_ended_dir(22);
    let policy = SamplingPolicy {
        temperature: 1.0,
        seed: Some(99),
        ..SamplingPolicy::default()
    };
    let service = service_for(dir.path(), 12).with_default_policy(policy);

    let (a, _, _) = drain(service.generate(question(), None).await.unwrap()).await;
    let (b, _, _) = drain(service.generate(question(), None).await.unwrap()).await;
    assert_eq!(a, b);
}

#[tokio::test]
async fn cancelling_after_k_tokens_yields_no_more_tokens() {
    let dir = open_ended_dir(23);
    let service = service_for(dir.path(), 40);
    let mut stream = service.generate(question(), Some(SamplingPolicy::greedy())).await.unwrap();
    let cancel = stream.cancel_handle();

    for _ in 0..3 {
        assert!(matches!(stream.next().await, Some(Ok(GenerationEvent::Token { .. }))));
    }
    cancel.cancel();
    match stream.next().await {
        Some(Ok(GenerationEvent::Done(summary))) => {
            assert_eq!(summary.reason, FinishReason::Cancelled);
            assert_eq!(summary.generated_tokens, 3);
        }
        other => panic!("expected Done, got {other:?}"),
    }
    assert!(stream.next().await.is_none());

    let health = service.health();
    assert!(health.ready);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(service.registry().active_leases(), 0);
}

#[tokio::test]
async fn dropping_a_stream_releases_its_lease() {
    let dir = open_ended_dir(24);
    let service = service_for(dir.path(), 40);
    let mut stream = service.generate(question(), None).await.unwrap();
    assert!(stream.next().await.is_some());
    assert_eq!(service.registry().active_leases(), 1);

    drop(stream);
    assert_eq!(service.registry().active_leases(), 0);
    assert_eq!(service.registry().status().state, LoadState::Ready);
}

#[tokio::test]
async fn health_is_available_while_a_reply_is_open() {
    let dir = open_ended_dir(25);
    let service = service_for(dir.path(), 40);
    assert!(!service.health().ready);

    let mut stream = service.generate(question(), None).await.unwrap();
    stream.next().await.unwrap().unwrap();
    let health = service.health();
    assert!(health.ready);
    assert_eq!(health.state, LoadState::Ready);
    assert!(!health.unhealthy);
}

#[tokio::test]
async fn reply_stops_at_an_end_of_sequence_token() {
    let scout_dir = open_ended_dir(26);
    let scout = service_for(scout_dir.path(), 1);
    let (first, _, _) = drain(scout.generate(greeting(), Some(SamplingPolicy::greedy())).await.unwrap()).await;

    let mut config = open_ended_config();
    config.eos_token_ids = vec![first[0]];
    let dir = model_dir_with(&config, 26);
    let mut file = tokenizer::testing::chat_file();
    file.eos_token = None;
    file.end_of_turn_token = None;
    file.save(dir.path().join("tokenizer.json")).unwrap();

    let service = service_for(dir.path(), 20);
    let (ids, _, summary) = drain(service.generate(greeting(), Some(SamplingPolicy::greedy())).await.unwrap()).await;
    assert!(ids.is_empty());
    assert_eq!(summary.reason, FinishReason::Stop);
}

#[tokio::test]
async fn load_progress_climbs_to_ready() {
    let dir = open_ended_dir(27);
    let service = GenerationService::from_config(&EngineConfig {
        model_dir: dir.path().to_path_buf(),
        ..EngineConfig::default()
    });

    let updates: Vec<_> = service.load_model().collect().await;
    let statuses: Vec<_> = updates.into_iter().map(|u| u.unwrap()).collect();
    let last = statuses.last().unwrap();
    assert_eq!(last.state, LoadState::Ready);
    assert_eq!(last.progress, 1.0);
    for pair in statuses.windows(2) {
        assert!(pair[0].progress <= pair[1].progress);
    }

    // Already resident: a second request resolves at once without reloading.
    let again: Vec<_> = service.load_model().collect().await;
    assert_eq!(again.len(), 1);
    assert_eq!(service.registry().load_count(), 1);
}

#[tokio::test]
async fn load_errors_end_the_progress_stream() {
    let empty = tempfile::tempdir().unwrap();
    let service = service_for(empty.path(), 8);
    let mut updates: Vec<_> = service.load_model().collect().await;
    assert!(updates.pop().unwrap().is_err());
    for update in updates {
        assert_eq!(update.unwrap().state, LoadState::Loading);
    }

    let err = service.generate(question(), None).await.unwrap_err();
    assert!(matches!(err, inference::GenerationError::Load(_)));
}

#[tokio::test]
async fn empty_conversations_are_rejected() {
    let dir = open_ended_dir(28);
    let service = service_for(dir.path(), 8);
    let err = service.generate(ConversationContext::new(), None).await.unwrap_err();
    assert!(matches!(err, inference::GenerationError::EmptyPrompt));
}

#[tokio::test]
async fn compute_errors_end_only_the_current_reply() {
    let z = tokenizer::testing::chat_file().vocab["z"];
    let dir = poisoned_embedding_dir(z, 29);
    let service = service_for(dir.path(), 1);

    let mut ctx = ConversationContext::new();
    ctx.user("zzz");
    let mut stream = service.generate(ctx, Some(SamplingPolicy::greedy())).await.unwrap();
    match stream.next().await {
        Some(Err(GenerationError::Compute(_))) => {}
        other => panic!("expected a compute error, got {other:?}"),
    }
    assert!(stream.next().await.is_none());

    let health = service.health();
    assert!(health.ready);
    assert_eq!(health.state, LoadState::Ready);
    assert_eq!(health.consecutive_failures, 1);
    assert_eq!(service.registry().active_leases(), 0);

    // Same model, next request.
    let (_, _, summary) = drain(service.generate(greeting(), Some(SamplingPolicy::greedy())).await.unwrap()).await;
    assert_eq!(summary.reason, FinishReason::Length);
    assert_eq!(service.health().consecutive_failures, 0);
    assert_eq!(service.registry().load_count(), 1);
}
