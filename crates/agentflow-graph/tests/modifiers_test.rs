use std::sync::Arc;
use std::time::Duration;

use agentflow_graph::{
    ChatTurn, CodeExtractor, Followup, Graph, GraphError, KeywordRetriever, LeafOutput, Modifier, Node,
    RetrievalInjector, Step, StepOutput, Turn, Upstream, CODE_BLOCKS_KEY, CODE_KEY, RETRIEVED_CONTEXT_KEY,
};
use agentflow_graph::{EventSender, Result};
use agentflow_llm::{ChatResponse, Message, StubClient};
use async_trait::async_trait;

fn chat(stub: &Arc<StubClient>) -> ChatTurn {
    ChatTurn::new().with_client(stub.clone())
}

/// Writes its name into graph metadata after a pause
struct Stamp {
    name: &'static str,
    delay: Duration,
}

#[async_trait]
impl Node for Stamp {
    fn kind(&self) -> &'static str {
        "stamp"
    }

    async fn execute(&self, step: &Step, _input: Vec<Message>, _events: Option<EventSender>) -> Result<StepOutput> {
        tokio::time::sleep(self.delay).await;
        step.graph()?.set_metadata("winner", self.name);
        Ok(StepOutput::Message(Message::human(self.name)))
    }
}

struct Broken;

/// Fails the run if any step settled before the begin hooks finished
struct NothingRunYet;

#[async_trait]
impl Modifier for NothingRunYet {
    fn name(&self) -> &str {
        "nothing_run_yet"
    }

    async fn on_begin(&self, graph: &Graph) -> Result<()> {
        match graph.steps().iter().find(|s| s.is_invoked()) {
            Some(step) => Err(GraphError::StructureFrozen(step.id().to_string())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Modifier for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn on_end(&self, _graph: &Graph) -> Result<()> {
        Err(GraphError::NoActiveGraph)
    }
}

#[tokio::test]
async fn test_followup_grafts_a_child_that_runs_next_round() {
    let stub = Arc::new(StubClient::with_responses(vec![
        ChatResponse::text("need more detail"),
        ChatResponse::text("final"),
    ]));
    let graph = Graph::new();

    let graft_client = stub.clone();
    let followup = Arc::new(Followup::new(
        ChatTurn::KIND,
        |output: &StepOutput| output.text().is_some_and(|t| t.contains("more")),
        move |graph: &Graph, _trigger: &Step| Ok(Step::new_in(graph, ChatTurn::new().with_client(graft_client.clone()))),
    ));
    graph.add_modifier_arc(followup.clone());

    let first = Step::new_in(&graph, Turn::human("question"))
        .then(&Step::new_in(&graph, ChatTurn::new().with_client(stub.clone())))
        .unwrap();

    let output = graph.invoke().await.unwrap().unwrap();

    assert_eq!(output.text(), Some("final"));
    assert_eq!(followup.grafted(), 1);
    assert_eq!(graph.len(), 3);

    let grafted = graph.children(&first);
    assert_eq!(grafted.len(), 1);
    assert!(grafted[0].is_invoked());
    assert_eq!(stub.requests()[1].last(), Some(&Message::assistant("need more detail")));
}

#[tokio::test]
async fn test_followup_respects_its_graft_limit() {
    let stub = Arc::new(StubClient::new("more please"));
    let graph = Graph::builder().max_rounds(10).build();

    let client = stub.clone();
    graph.add_modifier(
        Followup::new(
            ChatTurn::KIND,
            |_: &StepOutput| true,
            move |graph: &Graph, _: &Step| Ok(Step::new_in(graph, ChatTurn::new().with_client(client.clone()))),
        )
        .max_grafts(2),
    );
    Step::new_in(&graph, ChatTurn::new().with_client(stub.clone()));

    graph.invoke().await.unwrap();

    assert_eq!(graph.len(), 3);
    assert_eq!(stub.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_followup_limit_holds_under_concurrent_steps() {
    let graph = Graph::new();
    let triggers: Vec<Step> = (0..8)
        .map(|i| Step::new_in(&graph, Turn::assistant(format!("answer {i}"))))
        .collect();
    for step in &triggers {
        step.invoke().await.unwrap();
    }

    let followup = Arc::new(
        Followup::new(
            Turn::ASSISTANT,
            |_: &StepOutput| true,
            |graph: &Graph, _: &Step| Ok(Step::new_in(graph, Turn::human("more"))),
        )
        .max_grafts(2),
    );

    let handles: Vec<_> = triggers
        .iter()
        .cloned()
        .map(|step| {
            let graph = graph.clone();
            let followup = followup.clone();
            tokio::spawn(async move { followup.on_after_step(&graph, &step).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(followup.grafted(), 2);
    assert_eq!(graph.len(), 10);
}

#[tokio::test]
async fn test_followup_discards_a_graft_it_cannot_wire() {
    let graph = Graph::new();
    let elsewhere = Graph::new();
    let foreign = elsewhere.clone();
    let followup = Arc::new(Followup::new(
        Turn::ASSISTANT,
        |_: &StepOutput| true,
        move |_: &Graph, _: &Step| Ok(Step::new_in(&foreign, Turn::human("wrong graph"))),
    ));
    graph.add_modifier_arc(followup.clone());
    Step::new_in(&graph, Turn::assistant("start"));

    match graph.invoke().await {
        Err(GraphError::Modifier { name, .. }) => assert_eq!(name, "followup"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(followup.grafted(), 0);
    assert!(elsewhere.is_empty());
    assert_eq!(graph.len(), 1);
}

#[tokio::test]
async fn test_endless_grafting_hits_the_round_limit() {
    let graph = Graph::builder().max_rounds(3).build();
    graph.add_modifier(
        Followup::new(
            Turn::ASSISTANT,
            |_: &StepOutput| true,
            |graph: &Graph, _: &Step| Ok(Step::new_in(graph, Turn::assistant("again"))),
        )
        .max_grafts(usize::MAX),
    );
    Step::new_in(&graph, Turn::assistant("start"));

    assert!(matches!(graph.invoke().await, Err(GraphError::MaxRounds(3))));
}

#[tokio::test]
async fn test_sibling_metadata_writes_keep_the_last_writer() {
    let graph = Graph::new();
    let slow = Step::new_in(&graph, Stamp { name: "slow", delay: Duration::from_millis(40) });
    let fast = Step::new_in(&graph, Stamp { name: "fast", delay: Duration::from_millis(5) });
    [slow, fast]
        .then(&Step::new_in(&graph, Turn::assistant("joined")))
        .unwrap();

    graph.invoke().await.unwrap();

    assert_eq!(graph.metadata("winner"), Some(serde_json::json!("slow")));
}

#[tokio::test]
async fn test_code_blocks_are_extracted_from_replies() {
    let stub = Arc::new(StubClient::new(
        "Try this:\n```python\nprint('a')\n```\nor\n```rust\nfn main() {}\n```",
    ));
    let graph = Graph::builder().modifier(CodeExtractor::new()).build();
    let step = Step::new_in(&graph, ChatTurn::new().with_client(stub));
    let human = Step::new_in(&graph, Turn::human("```ignored\nnot assistant\n```"));
    step.after(&human).unwrap();

    graph.invoke().await.unwrap();

    assert_eq!(graph.metadata(CODE_KEY), Some(serde_json::json!("fn main() {}")));
    let blocks = step.metadata(CODE_BLOCKS_KEY).unwrap();
    assert_eq!(blocks.as_array().map(Vec::len), Some(2));
    assert!(human.metadata(CODE_BLOCKS_KEY).is_none());
}

#[tokio::test]
async fn test_retrieved_context_is_prepended_to_chat_requests() {
    let retriever = Arc::new(KeywordRetriever::new([
        "Rust ownership moves values between bindings",
        "Python uses reference counting",
    ]));
    let stub = Arc::new(StubClient::new("answer"));
    let graph = Graph::builder()
        .modifier(RetrievalInjector::new(retriever).with_limit(1))
        .build();

    graph.sync_scope(|| {
        let system = Step::build(Turn::system("be brief")).unwrap();
        let human = Step::build(Turn::human("how does ownership work in rust?")).unwrap();
        [system, human]
            .then(&Step::build(ChatTurn::new().with_client(stub.clone())).unwrap())
            .unwrap();
    });

    graph.invoke().await.unwrap();

    assert_eq!(
        graph.metadata(RETRIEVED_CONTEXT_KEY),
        Some(serde_json::json!("Rust ownership moves values between bindings"))
    );
    assert_eq!(
        stub.requests(),
        vec![vec![
            Message::system("Rust ownership moves values between bindings\nbe brief"),
            Message::human("how does ownership work in rust?"),
        ]]
    );
}

#[tokio::test]
async fn test_retrieval_reaches_every_chat_turn_in_a_conversation() {
    let retriever = Arc::new(KeywordRetriever::new(["Rust ownership moves values", "Python lists"]));
    let stub = Arc::new(StubClient::new("noted"));
    let graph = Graph::builder().modifier(RetrievalInjector::new(retriever)).build();

    let (h1, c2) = graph.sync_scope(|| {
        let h1 = Step::build(Turn::human("rust ownership")).unwrap();
        let c1 = h1.then(&Step::build(chat(&stub)).unwrap()).unwrap();
        let h2 = c1.then(&Step::build(Turn::human("and after a move?")).unwrap()).unwrap();
        let c2 = h2.then(&Step::build(chat(&stub)).unwrap()).unwrap();
        (h1, c2)
    });

    graph.invoke().await.unwrap();

    let requests = stub.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.first(), Some(&Message::system("Rust ownership moves values")));
    }
    assert_eq!(requests[0][1], Message::human("rust ownership"));
    assert!(h1.is_invoked() && c2.is_invoked());
}

#[tokio::test]
async fn test_retrieval_leaves_steps_unrun_for_later_begin_hooks() {
    let retriever = Arc::new(KeywordRetriever::new(["anything"]));
    let graph = Graph::builder()
        .modifier(RetrievalInjector::new(retriever))
        .modifier(NothingRunYet)
        .build();
    Step::new_in(&graph, Turn::human("anything at all"));

    graph.invoke().await.unwrap();

    assert_eq!(graph.metadata(RETRIEVED_CONTEXT_KEY), Some(serde_json::json!("anything")));
}

#[tokio::test]
async fn test_query_metadata_overrides_human_turns() {
    let retriever = Arc::new(KeywordRetriever::new(["Rust ownership", "Python reference counting"]));
    let stub = Arc::new(StubClient::new("answer"));
    let graph = Graph::builder()
        .modifier(RetrievalInjector::new(retriever))
        .metadata("query", "python counting")
        .build();
    Step::new_in(&graph, Turn::human("tell me about rust ownership"))
        .then(&Step::new_in(&graph, ChatTurn::new().with_client(stub.clone())))
        .unwrap();

    graph.invoke().await.unwrap();

    assert_eq!(
        graph.metadata(RETRIEVED_CONTEXT_KEY),
        Some(serde_json::json!("Python reference counting"))
    );
}

#[tokio::test]
async fn test_leaf_output_pins_the_chosen_leaf() {
    let graph = Graph::new();
    Step::new_in(&graph, Turn::assistant("first"));
    Step::new_in(&graph, Turn::human("second"));

    graph.invoke().await.unwrap();
    assert!(graph.output().is_none());

    graph.add_modifier(LeafOutput::of_kind(Turn::ASSISTANT));
    let output = graph.invoke().await.unwrap();
    assert_eq!(output, Some(StepOutput::Message(Message::assistant("first"))));
}

#[tokio::test]
async fn test_modifier_failures_name_the_modifier() {
    let graph = Graph::builder().modifier(Broken).build();
    Step::new_in(&graph, Turn::human("hi"));

    match graph.invoke().await {
        Err(GraphError::Modifier { name, .. }) => assert_eq!(name, "broken"),
        other => panic!("unexpected result: {other:?}"),
    }
}
