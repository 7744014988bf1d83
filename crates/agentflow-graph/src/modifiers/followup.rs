use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::Graph;
use crate::modifier::Modifier;
use crate::node::StepOutput;
use crate::step::Step;

type Predicate = dyn Fn(&StepOutput) -> bool + Send + Sync;
type Graft = dyn Fn(&Graph, &Step) -> Result<Step> + Send + Sync;

/// Grafts a reaction onto steps whose output asks for one.
///
/// When a step of the watched kind settles and its output matches, the graft
/// closure builds a new step (with any extra edges it needs); the new step is
/// then made a child of the trigger. Grafted steps run in the graph's next
/// round.
pub struct Followup {
    kind: String,
    predicate: Box<Predicate>,
    graft: Box<Graft>,
    max_grafts: usize,
    grafted: AtomicUsize,
}

impl Followup {
    pub fn new<P, G>(kind: impl Into<String>, predicate: P, graft: G) -> Self
    where
        P: Fn(&StepOutput) -> bool + Send + Sync + 'static,
        G: Fn(&Graph, &Step) -> Result<Step> + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            predicate: Box::new(predicate),
            graft: Box::new(graft),
            max_grafts: 1,
            grafted: AtomicUsize::new(0),
        }
    }

    /// Allow up to `max` grafts over the modifier's lifetime
    pub fn max_grafts(mut self, max: usize) -> Self {
        self.max_grafts = max;
        self
    }

    pub fn grafted(&self) -> usize {
        self.grafted.load(Ordering::SeqCst)
    }

    fn reserve(&self) -> bool {
        self.grafted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < self.max_grafts).then_some(n + 1))
            .is_ok()
    }

    fn release(&self) {
        self.grafted.fetch_sub(1, Ordering::SeqCst);
    }

    fn attach(&self, graph: &Graph, step: &Step) -> Result<Step> {
        let child = (self.graft)(graph, step)?;
        if let Err(err) = child.add_parent(step, None) {
            if let Ok(owner) = child.graph() {
                owner.discard_step(&child);
            }
            return Err(err);
        }
        Ok(child)
    }
}

#[async_trait]
impl Modifier for Followup {
    fn name(&self) -> &str {
        "followup"
    }

    async fn on_after_step(&self, graph: &Graph, step: &Step) -> Result<()> {
        if step.kind() != self.kind {
            return Ok(());
        }
        let Some(output) = step.output() else {
            return Ok(());
        };
        if !(self.predicate)(&output) || !self.reserve() {
            return Ok(());
        }

        match self.attach(graph, step) {
            Ok(child) => {
                tracing::debug!(trigger = %step.id(), grafted = %child.id(), "followup step grafted");
                Ok(())
            }
            Err(err) => {
                self.release();
                Err(err)
            }
        }
    }
}
