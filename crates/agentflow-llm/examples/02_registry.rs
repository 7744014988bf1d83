use std::sync::Arc;

use anyhow::Result;
use agentflow_llm::{
    count_message_tokens, ChatClient, ChatRequest, Message, ModelRegistry, ModelSource, OpenAIClient, OpenAIConfig,
    RegisterOptions, StubClient, TiktokenTokenizer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let registry = ModelRegistry::new();
    let tokenizer = Arc::new(TiktokenTokenizer::cl100k()?);

    // Offline fallback is registered first so it becomes the default.
    registry.register(
        "offline",
        ModelSource::instance(StubClient::new("I am a scripted reply.")),
        RegisterOptions::new().tokenizer(tokenizer.clone()).max_tokens(4096),
    );

    // Built lazily: nothing touches the network until the model is requested.
    registry.register(
        "openai",
        ModelSource::factory(|| {
            let api_key = std::env::var("OPENAI_API_KEY")?;
            Ok(Arc::new(OpenAIClient::new(OpenAIConfig::new(api_key, "gpt-4o-mini"))?) as Arc<dyn ChatClient>)
        }),
        RegisterOptions::new().tokenizer(tokenizer).max_tokens(128_000),
    );

    println!("Registered: {:?}", registry.get_registered_names());

    let messages = vec![Message::human("Say hello.")];
    let name = if std::env::var("OPENAI_API_KEY").is_ok() { "openai" } else { "offline" };

    if let Some(tokenizer) = registry.get_tokenizer(Some(name))? {
        println!("Prompt tokens ({}): {}", name, count_message_tokens(tokenizer.as_ref(), &messages));
    }

    let model = registry.get_model(Some(name))?;
    let response = model.chat(ChatRequest::new(messages)).await?;
    println!("{}: {}", name, response.content.unwrap_or_default());

    registry.unregister("openai");
    println!("After unregister: {:?}", registry.get_registered_names());

    Ok(())
}
