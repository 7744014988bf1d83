use std::sync::Arc;

use agentflow::prelude::*;

#[test]
fn test_registry_backed_graph_runs_from_the_prelude() {
    let registry = Arc::new(ModelRegistry::new());
    registry.register("stub", ModelSource::instance(StubClient::new("OK")), RegisterOptions::new());

    let graph = Graph::builder().registry(registry).build();
    graph.sync_scope(|| {
        let system = Step::build(Turn::system("be terse")).unwrap();
        let human = Step::build(Turn::human("hi")).unwrap();
        [system, human].then(&Step::build(ChatTurn::new()).unwrap()).unwrap();
    });

    let output = tokio_test::block_on(graph.invoke()).unwrap();
    assert_eq!(output.and_then(|o| o.text().map(str::to_string)).as_deref(), Some("OK"));
}
