//! Node factory dispatch
//!
//! Declared node types are resolved to concrete instances once at
//! construction; the scheduler only ever sees the uniform [`Node`] trait.

use indexmap::IndexMap;

use cascade_ir as ir;
use cascade_ir::NodeKey;

use crate::error::{Error, Result};
use crate::node::Node;

/// Builds node instances for the declared types it recognizes.
pub trait NodeFactory {
    /// Try to build an instance for `decl`. `Ok(None)` means the declared
    /// type is not handled by this factory and the next one should be
    /// consulted.
    fn create(&mut self, decl: &ir::Node) -> Result<Option<Box<dyn Node>>>;
}

/// Instantiate every program node through the first factory that claims it.
///
/// Fails with [`Error::UnknownNodeType`] if no factory recognizes a declared
/// type.
pub fn build_nodes(
    program: &ir::Program,
    factories: &mut [&mut dyn NodeFactory],
) -> Result<IndexMap<NodeKey, Box<dyn Node>>> {
    let mut nodes = IndexMap::with_capacity(program.nodes.len());
    for decl in &program.nodes {
        let mut instance = None;
        for factory in factories.iter_mut() {
            if let Some(node) = factory.create(decl)? {
                instance = Some(node);
                break;
            }
        }
        let Some(instance) = instance else {
            return Err(Error::UnknownNodeType {
                node: decl.key.clone(),
                kind: decl.kind.clone(),
            });
        };
        nodes.insert(decl.key.clone(), instance);
    }
    Ok(nodes)
}
