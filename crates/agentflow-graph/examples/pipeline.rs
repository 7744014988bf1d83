use std::sync::Arc;

use agentflow_graph::{
    ChatTurn, CodeExtractor, Graph, GraphConfig, GraphEvent, KeywordRetriever, LeafOutput, RetrievalInjector, Step,
    StepChunk, Turn, Upstream, CODE_KEY,
};
use agentflow_llm::{
    ChatClient, ModelRegistry, ModelSource, OpenAIClient, OpenAIConfig, RegisterOptions, StreamEvent, StubClient,
};
use anyhow::Result;
use futures::StreamExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
max_rounds = 8
event_buffer = 64
"#;

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("agentflow_graph=debug"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

/// OpenAI when a key is configured, a scripted stand-in otherwise
fn registry() -> Arc<ModelRegistry> {
    let registry = Arc::new(ModelRegistry::new());

    match std::env::var("OPENAI_API_KEY") {
        Ok(api_key) => {
            registry.register(
                "gpt-4o-mini",
                ModelSource::factory(move || {
                    let client = OpenAIClient::new(OpenAIConfig::new(api_key.clone(), "gpt-4o-mini"))?;
                    Ok(Arc::new(client) as Arc<dyn ChatClient>)
                }),
                RegisterOptions::new().max_tokens(128_000),
            );
        }
        Err(_) => {
            let stub = StubClient::new(
                "Ownership means each value has one owner:\n```rust\nlet s = String::from(\"hi\");\nlet t = s; // moved\n```",
            );
            registry.register("stub", ModelSource::instance(stub), RegisterOptions::new());
        }
    }

    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let retriever = Arc::new(KeywordRetriever::new([
        "Rust ownership: every value has a single owner and is dropped when the owner goes out of scope.",
        "Borrowing lets code use a value through references without taking ownership.",
        "Tokio is an asynchronous runtime for Rust.",
    ]));

    let (graph, mut events) = Graph::builder()
        .config(GraphConfig::from_toml_str(CONFIG)?)
        .registry(registry())
        .modifier(RetrievalInjector::new(retriever).with_limit(2))
        .modifier(CodeExtractor::new().language("rust"))
        .modifier(LeafOutput::of_kind(ChatTurn::KIND))
        .build_with_events();

    let answer = graph.sync_scope(|| -> agentflow_graph::Result<Step> {
        let system = Step::build(Turn::system("You are a concise Rust tutor."))?;
        let question = Step::build(Turn::human("Explain Rust ownership with a short example."))?;
        [system, question].then(&Step::build(ChatTurn::new())?)
    })?;

    let mut chunks = graph.stream();
    while let Some(chunk) = chunks.next().await {
        match chunk? {
            StepChunk::Delta {
                event: StreamEvent::Message { content },
                ..
            } => print!("{content}"),
            StepChunk::Delta { .. } => {}
            StepChunk::Final { step_id, .. } => println!("\n[{step_id} settled]"),
        }
    }

    if let Some(code) = graph.metadata(CODE_KEY) {
        println!("extracted code:\n{}", code.as_str().unwrap_or_default());
    }
    if let Some(output) = graph.output() {
        println!("graph output from {}: {} chars", answer.id(), output.text().map_or(0, str::len));
    }

    drop(chunks);
    drop(graph);
    while let Some(event) = events.recv().await {
        if let GraphEvent::StepInvoked { kind, duration_ms, .. } = event {
            println!("{kind:>10} {duration_ms}ms");
        }
    }

    Ok(())
}
