//! Append-only computation graph builder.
//!
//! Nodes can only reference outputs of nodes added before them, so every
//! graph this builder produces is acyclic. Ids are assigned in insertion
//! order starting at 1 and serialised as strings, which is the prompt
//! format the engine expects:
//!
//! ```json
//! { "1": { "class_type": "VAELoader", "inputs": { "vae_name": "x" } },
//!   "2": { "class_type": "VAEDecode", "inputs": { "vae": ["1", 0] } } }
//! ```

use serde_json::{Map, Value};

/// Opaque handle to a node already in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn output(self, slot: u32) -> Output {
        Output { node: self, slot }
    }

    pub fn key(self) -> String {
        self.0.to_string()
    }
}

/// One output slot of an existing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub node: NodeId,
    pub slot: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Literal(Value),
    Edge(Output),
}

impl From<Output> for Input {
    fn from(output: Output) -> Self {
        Input::Edge(output)
    }
}

macro_rules! literal_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Input {
            fn from(value: $ty) -> Self {
                Input::Literal(Value::from(value))
            }
        })*
    };
}

literal_from!(&str, String, f64, u32, u64, i64, bool);

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    class_type: String,
    inputs: Vec<(String, Input)>,
}

impl NodeSpec {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: Vec::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, value: impl Into<Input>) -> Self {
        self.inputs.push((name.into(), value.into()));
        self
    }

    pub fn class_type(&self) -> &str {
        &self.class_type
    }

    pub fn get(&self, name: &str) -> Option<&Input> {
        self.inputs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn inputs(&self) -> impl Iterator<Item = (&str, &Input)> {
        self.inputs.iter().map(|(n, v)| (n.as_str(), v))
    }
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeSpec>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `node`.
    ///
    /// # Panics
    ///
    /// If an edge points at a node this builder has not handed out.
    pub fn add(&mut self, node: NodeSpec) -> NodeId {
        let next = self.nodes.len() as u32 + 1;
        for (_, input) in &node.inputs {
            if let Input::Edge(out) = input {
                assert!(out.node.0 < next, "edge to a node that does not exist yet");
            }
        }
        self.nodes.push(node);
        NodeId(next)
    }

    pub fn build(self) -> ComputationGraph {
        ComputationGraph { nodes: self.nodes }
    }
}

/// A finished graph, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputationGraph {
    nodes: Vec<NodeSpec>,
}

impl ComputationGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NodeSpec)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32 + 1), n))
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSpec> {
        (id.0 as usize).checked_sub(1).and_then(|i| self.nodes.get(i))
    }

    /// Ids of every node with the given class, in insertion order.
    pub fn find(&self, class_type: &str) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.class_type == class_type)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn to_prompt_json(&self) -> Value {
        let mut prompt = Map::with_capacity(self.nodes.len());
        for (id, node) in self.nodes() {
            let mut inputs = Map::with_capacity(node.inputs.len());
            for (name, input) in &node.inputs {
                let value = match input {
                    Input::Literal(v) => v.clone(),
                    Input::Edge(out) => Value::Array(vec![
                        Value::String(out.node.key()),
                        Value::from(out.slot),
                    ]),
                };
                inputs.insert(name.clone(), value);
            }
            let mut entry = Map::new();
            entry.insert("class_type".into(), Value::String(node.class_type.clone()));
            entry.insert("inputs".into(), Value::Object(inputs));
            prompt.insert(id.key(), Value::Object(entry));
        }
        Value::Object(prompt)
    }
}
