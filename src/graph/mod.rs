//! Graph data model
//!
//! The in-memory representation the fusion engine operates on: an arena
//! of operator [`Node`]s addressed by stable ids, an interned
//! tensor-name table, constant [`Initializer`]s, and the maintained
//! producer/consumer/op-type indices, all owned by one [`GraphModel`].
//!
//! Construction happens once, from the external decode step or from a
//! test builder. Afterwards the model is queried freely and mutated only
//! through [`GraphModel::replace_subgraph`] and the initializer API.

pub mod model;
pub mod mutate;
pub mod node;
pub mod tensor;
pub mod topo;

pub use model::GraphModel;
pub use node::{AttrValue, Attribute, Node, NodeArena, NodeId};
pub use tensor::{DataType, Initializer, TensorData, TensorId, TensorTable};
