//! Operator nodes
//!
//! A node is one operator instance: an op-type tag, ordered input and
//! output tensor references, and named attributes. Nodes live in an
//! arena owned by the [`crate::graph::GraphModel`] and are addressed by
//! stable [`NodeId`]s.

use id_arena::{Arena, Id};

use crate::graph::tensor::TensorId;
use crate::op::OpType;

/// Stable arena handle for a node
pub type NodeId = Id<Node>;
/// Arena storing all nodes of one graph
pub type NodeArena = Arena<Node>;

/// Attribute value attached to a node
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Scalar integer
    Int(i64),
    /// Scalar float
    Float(f32),
    /// Integer list
    Ints(Vec<i64>),
    /// Float list
    Floats(Vec<f32>),
    /// String
    Str(String),
}

/// Named attribute
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Attribute name
    pub name: String,
    /// Attribute value
    pub value: AttrValue,
}

/// One operator instance
#[derive(Debug, Clone)]
pub struct Node {
    /// Operator tag
    pub op: OpType,
    /// Optional node name, kept for diagnostics
    pub name: Option<String>,
    /// Ordered input tensor references; position is significant
    pub inputs: Vec<TensorId>,
    /// Ordered output tensor references
    pub outputs: Vec<TensorId>,
    /// Named attributes
    pub attrs: Vec<Attribute>,
    pub(crate) deleted: bool,
}

impl Node {
    /// Create a node with no connections
    pub fn new(op: OpType) -> Self {
        Self {
            op,
            name: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: Vec::new(),
            deleted: false,
        }
    }

    /// Set the node name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append an input
    pub fn with_input(mut self, id: TensorId) -> Self {
        self.inputs.push(id);
        self
    }

    /// Append several inputs
    pub fn with_inputs(mut self, mut ids: Vec<TensorId>) -> Self {
        self.inputs.append(&mut ids);
        self
    }

    /// Append an output
    pub fn with_output(mut self, id: TensorId) -> Self {
        self.outputs.push(id);
        self
    }

    /// Append several outputs
    pub fn with_outputs(mut self, mut ids: Vec<TensorId>) -> Self {
        self.outputs.append(&mut ids);
        self
    }

    /// Attach an integer attribute
    pub fn with_attr_i(mut self, name: impl Into<String>, value: i64) -> Self {
        self.attrs.push(Attribute {
            name: name.into(),
            value: AttrValue::Int(value),
        });
        self
    }

    /// Attach a float attribute
    pub fn with_attr_f(mut self, name: impl Into<String>, value: f32) -> Self {
        self.attrs.push(Attribute {
            name: name.into(),
            value: AttrValue::Float(value),
        });
        self
    }

    /// Attach an integer-list attribute
    pub fn with_attr_ints(mut self, name: impl Into<String>, values: Vec<i64>) -> Self {
        self.attrs.push(Attribute {
            name: name.into(),
            value: AttrValue::Ints(values),
        });
        self
    }

    /// Get attribute value as i64
    pub fn attr_i(&self, name: &str) -> Option<i64> {
        self.attrs.iter().find(|a| a.name == name).and_then(|a| {
            if let AttrValue::Int(v) = a.value {
                Some(v)
            } else {
                None
            }
        })
    }

    /// Get attribute value as f32
    pub fn attr_f(&self, name: &str) -> Option<f32> {
        self.attrs.iter().find(|a| a.name == name).and_then(|a| {
            if let AttrValue::Float(v) = a.value {
                Some(v)
            } else {
                None
            }
        })
    }

    /// Get attribute value as an i64 slice
    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        self.attrs.iter().find(|a| a.name == name).and_then(|a| {
            if let AttrValue::Ints(v) = &a.value {
                Some(v.as_slice())
            } else {
                None
            }
        })
    }

    /// Whether the node has been removed from its graph
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Given one input of a binary node, return the other
    pub fn other_input(&self, input: TensorId) -> Option<TensorId> {
        if self.inputs.len() != 2 {
            return None;
        }
        if self.inputs[0] == input {
            Some(self.inputs[1])
        } else if self.inputs[1] == input {
            Some(self.inputs[0])
        } else {
            None
        }
    }
}
