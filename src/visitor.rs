//! The single authoritative traversal mechanism for markup ASTs.
//!
//! Rules:
//! 1. Traversal is pre-order, depth-first, rewrite-in-place: the rewriter
//!    sees a parent before its children, and children always reflect the
//!    post-rewrite parent's view.
//! 2. A rewriter receives a node by value and must return a node; there is
//!    no "remove" answer. Returning the input unchanged is always legal.
//! 3. Nodes whose `skip_rewrite` flag is set are returned as-is, children
//!    included.
//! 4. No manual recursion outside of this system.

use crate::ast::{Node, NodeKind, SourceLocation};
use crate::diagnostics::CompilerError;
use crate::types::XamlType;

// ═══════════════════════════════════════════════════════════════════════════════
// ANCESTOR STACK
// ═══════════════════════════════════════════════════════════════════════════════

/// Lightweight summary of a lexical ancestor, pushed while its children are
/// being rewritten. Transformers use this to ask questions like "am I a
/// direct argument of a markup-extension node" without aliasing the tree.
#[derive(Debug, Clone)]
pub struct AncestorInfo {
    pub kind: NodeKind,
    pub location: SourceLocation,
    /// Resolved type of an object/new-object ancestor, when known.
    pub object_type: Option<XamlType>,
}

impl Node {
    fn ancestor_info(&self) -> AncestorInfo {
        let object_type = match self {
            Node::Object(o) => match o.type_reference.as_ref() {
                Node::ClrType(t) => Some(t.ty.clone()),
                _ => None,
            },
            Node::NewObject(n) => Some(n.ty.clone()),
            _ => None,
        };
        AncestorInfo {
            kind: self.kind(),
            location: self.location(),
            object_type,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REWRITER
// ═══════════════════════════════════════════════════════════════════════════════

pub trait NodeRewriter {
    fn rewrite(&mut self, ancestors: &[AncestorInfo], node: Node) -> Result<Node, CompilerError>;
}

/// Rewrite a whole subtree. Entry point used by every pipeline pass.
pub fn rewrite_tree(node: Node, rewriter: &mut dyn NodeRewriter) -> Result<Node, CompilerError> {
    let mut ancestors = Vec::new();
    rewrite_recursive(node, rewriter, &mut ancestors)
}

fn rewrite_recursive(
    node: Node,
    rewriter: &mut dyn NodeRewriter,
    ancestors: &mut Vec<AncestorInfo>,
) -> Result<Node, CompilerError> {
    if node.skip_rewrite() {
        return Ok(node);
    }
    let node = rewriter.rewrite(ancestors, node)?;
    ancestors.push(node.ancestor_info());
    let result = rewrite_children(node, &mut |child| {
        rewrite_recursive(child, rewriter, ancestors)
    });
    ancestors.pop();
    result
}

/// Reassign each child slot of `node` with the rewriter's answer. Each node
/// kind knows precisely which of its fields are child nodes.
fn rewrite_children(
    node: Node,
    f: &mut dyn FnMut(Node) -> Result<Node, CompilerError>,
) -> Result<Node, CompilerError> {
    fn each(
        nodes: Vec<Node>,
        f: &mut dyn FnMut(Node) -> Result<Node, CompilerError>,
    ) -> Result<Vec<Node>, CompilerError> {
        nodes.into_iter().map(|n| f(n)).collect()
    }
    fn one(
        node: Box<Node>,
        f: &mut dyn FnMut(Node) -> Result<Node, CompilerError>,
    ) -> Result<Box<Node>, CompilerError> {
        Ok(Box::new(f(*node)?))
    }

    Ok(match node {
        Node::XmlType(mut n) => {
            n.generic_arguments = each(n.generic_arguments, f)?;
            Node::XmlType(n)
        }
        Node::NameProperty(mut n) => {
            n.declaring_type = one(n.declaring_type, f)?;
            n.target_type = one(n.target_type, f)?;
            Node::NameProperty(n)
        }
        Node::Object(mut n) => {
            n.type_reference = one(n.type_reference, f)?;
            n.arguments = each(n.arguments, f)?;
            n.children = each(n.children, f)?;
            Node::Object(n)
        }
        Node::NewObject(mut n) => {
            n.arguments = each(n.arguments, f)?;
            Node::NewObject(n)
        }
        Node::TypeLiteral(mut n) => {
            n.type_reference = one(n.type_reference, f)?;
            Node::TypeLiteral(n)
        }
        Node::Directive(mut n) => {
            n.values = each(n.values, f)?;
            Node::Directive(n)
        }
        Node::PropertyValue(mut n) => {
            n.property = one(n.property, f)?;
            n.values = each(n.values, f)?;
            Node::PropertyValue(n)
        }
        Node::Assignment(mut n) => {
            n.arguments = each(n.arguments, f)?;
            Node::Assignment(n)
        }
        Node::MethodCall(mut n) => {
            n.arguments = each(n.arguments, f)?;
            Node::MethodCall(n)
        }
        Node::ManipulationGroup(mut n) => {
            n.children = each(n.children, f)?;
            Node::ManipulationGroup(n)
        }
        Node::ValueWithManipulations(mut n) => {
            n.value = one(n.value, f)?;
            n.manipulation = one(n.manipulation, f)?;
            Node::ValueWithManipulations(n)
        }
        Node::ObjectInitialization(mut n) => {
            n.manipulation = one(n.manipulation, f)?;
            Node::ObjectInitialization(n)
        }
        Node::MarkupExtension(mut n) => {
            n.value = one(n.value, f)?;
            Node::MarkupExtension(n)
        }
        Node::DeferredContent(mut n) => {
            n.value = one(n.value, f)?;
            Node::DeferredContent(n)
        }
        Node::LocalValue(mut n) => {
            n.value = one(n.value, f)?;
            Node::LocalValue(n)
        }
        Node::LocalManipulation(mut n) => {
            n.manipulation = one(n.manipulation, f)?;
            Node::LocalManipulation(n)
        }
        // Leaves: no child slots.
        leaf @ (Node::ClrType(_)
        | Node::ClrProperty(_)
        | Node::Text(_)
        | Node::Null(_)
        | Node::Placeholder(_)) => leaf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ManipulationGroupNode, PlaceholderNode, TextNode};

    struct CountingRewriter {
        seen: Vec<NodeKind>,
        depth_at_text: Option<usize>,
    }

    impl NodeRewriter for CountingRewriter {
        fn rewrite(
            &mut self,
            ancestors: &[AncestorInfo],
            node: Node,
        ) -> Result<Node, CompilerError> {
            self.seen.push(node.kind());
            if node.kind() == NodeKind::Text {
                self.depth_at_text = Some(ancestors.len());
            }
            Ok(node)
        }
    }

    fn text(s: &str) -> Node {
        Node::Text(TextNode {
            text: s.to_string(),
            ty: None,
            location: SourceLocation::default(),
        })
    }

    #[test]
    fn traversal_is_preorder_with_ancestor_stack() {
        let tree = Node::ManipulationGroup(ManipulationGroupNode {
            children: vec![Node::ManipulationGroup(ManipulationGroupNode {
                children: vec![text("leaf")],
                location: SourceLocation::default(),
            })],
            location: SourceLocation::default(),
        });
        let mut r = CountingRewriter {
            seen: vec![],
            depth_at_text: None,
        };
        rewrite_tree(tree, &mut r).unwrap();
        assert_eq!(
            r.seen,
            vec![
                NodeKind::ManipulationGroup,
                NodeKind::ManipulationGroup,
                NodeKind::Text
            ]
        );
        // Two group ancestors above the text node.
        assert_eq!(r.depth_at_text, Some(2));
    }

    #[test]
    fn placeholders_are_never_visited() {
        let tree = Node::ManipulationGroup(ManipulationGroupNode {
            children: vec![Node::Placeholder(PlaceholderNode {
                description: "abandoned".to_string(),
                location: SourceLocation::default(),
            })],
            location: SourceLocation::default(),
        });
        let mut r = CountingRewriter {
            seen: vec![],
            depth_at_text: None,
        };
        rewrite_tree(tree, &mut r).unwrap();
        assert_eq!(r.seen, vec![NodeKind::ManipulationGroup]);
    }

    #[test]
    fn rewriter_replacement_applies_to_children_of_replacement() {
        struct Replacer;
        impl NodeRewriter for Replacer {
            fn rewrite(&mut self, _a: &[AncestorInfo], node: Node) -> Result<Node, CompilerError> {
                Ok(match node {
                    Node::Text(mut t) => {
                        t.text = t.text.to_uppercase();
                        Node::Text(t)
                    }
                    other => other,
                })
            }
        }
        let tree = Node::ManipulationGroup(ManipulationGroupNode {
            children: vec![text("abc")],
            location: SourceLocation::default(),
        });
        let out = rewrite_tree(tree, &mut Replacer).unwrap();
        match out {
            Node::ManipulationGroup(g) => match &g.children[0] {
                Node::Text(t) => assert_eq!(t.text, "ABC"),
                other => panic!("unexpected {:?}", other.kind()),
            },
            other => panic!("unexpected {:?}", other.kind()),
        }
    }
}
