use anyhow::Result;
use agentflow_llm::{ChatClient, ChatRequest, Message, OpenAIClient, OpenAIConfig, StreamAccumulator, StreamEvent};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<()> {
    let api_key = std::env::var("OPENAI_API_KEY")?;
    let client = OpenAIClient::new(OpenAIConfig::new(api_key, "gpt-4o-mini"))?;

    let request = ChatRequest::new(vec![
        Message::system("Answer in one sentence."),
        Message::human("What is the capital of France?"),
    ]);

    let response = client.chat(request.clone()).await?;
    println!("Response: {}", response.content.unwrap_or_default());

    if let Some(usage) = response.usage {
        println!("Tokens used: {}", usage.total_tokens);
    }

    println!("\nStreaming:");
    let mut stream = client.chat_stream(request).await?;
    let mut acc = StreamAccumulator::new();
    while let Some(event) = stream.next().await {
        let event = event?;
        if let StreamEvent::Message { content } = &event {
            print!("{}", content);
        }
        acc.push(&event);
    }
    println!("\n\nFinish reason: {:?}", acc.finish().finish_reason);

    Ok(())
}
