//! Late lowering passes.
//!
//! Value-type and string elements collapse into converted text. Deferred
//! properties get their value wrapped in a factory marker. Objects usable
//! during initialization are split so the parent assignment runs before
//! the child's own initialization. The final pass flattens manipulation
//! groups into canonical shape.

use crate::ast::{DeferredContentNode, LocalManipulationNode, LocalValueNode, Node};
use crate::diagnostics::{CompilerError, ERR_STRUCT_CONSTRUCTION};
use crate::transform::{try_convert_value, AstTransformer, TransformContext};
use crate::types::has_attribute_in_hierarchy;
use crate::visitor::AncestorInfo;

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 10: VALUE-TYPE / STRING CONSTRUCTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A value-type or string element has no constructor to call; it must be a
/// single text node the conversion table understands.
pub struct ValueTypeConstructionTransformer;

impl AstTransformer for ValueTypeConstructionTransformer {
    fn name(&self) -> &'static str {
        "value-type-construction"
    }

    fn transform(
        &self,
        ctx: &mut TransformContext<'_>,
        _ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError> {
        let obj = match node {
            Node::Object(o) => o,
            other => return Ok(other),
        };
        let ty = match obj.type_reference.as_ref() {
            Node::ClrType(t) => t.ty.clone(),
            _ => return Ok(Node::Object(obj)),
        };
        if !ty.is_value_type() && ty != ctx.well_known.string {
            return Ok(Node::Object(obj));
        }
        if !obj.arguments.is_empty() {
            return Err(ctx.error(
                ERR_STRUCT_CONSTRUCTION,
                &format!(
                    "'{}' does not take constructor arguments",
                    ty.full_name()
                ),
                obj.location,
            ));
        }
        let mut children = obj.children;
        let single = match (children.len(), children.pop()) {
            (1, Some(Node::Text(t))) => t,
            _ => {
                return Err(ctx.error(
                    ERR_STRUCT_CONSTRUCTION,
                    &format!(
                        "'{}' must be built from exactly one text value",
                        ty.full_name()
                    ),
                    obj.location,
                ))
            }
        };
        match try_convert_value(&Node::Text(single.clone()), &ty, ctx.well_known) {
            Some(converted) => Ok(converted),
            None => Err(ctx.error(
                ERR_STRUCT_CONSTRUCTION,
                &format!(
                    "no conversion from '{}' to '{}'",
                    single.text,
                    ty.full_name()
                ),
                single.location,
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 11: DEFERRED CONTENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Wraps the value of every assignment to a deferred-content property so
/// emission produces a factory instead of constructing the value inline.
pub struct DeferredContentTransformer;

impl AstTransformer for DeferredContentTransformer {
    fn name(&self) -> &'static str {
        "deferred-content"
    }

    fn transform(
        &self,
        ctx: &mut TransformContext<'_>,
        _ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError> {
        let mut assignment = match node {
            Node::Assignment(a) => a,
            other => return Ok(other),
        };
        if !assignment
            .property
            .has_attribute(&ctx.config.deferred_content_attribute)
        {
            return Ok(Node::Assignment(assignment));
        }
        if let Some(value) = assignment.arguments.last_mut() {
            if !matches!(value, Node::DeferredContent(_)) {
                let location = value.location();
                let inner = std::mem::replace(
                    value,
                    Node::Placeholder(crate::ast::PlaceholderNode {
                        description: "deferred value in flight".to_string(),
                        location,
                    }),
                );
                *value = Node::DeferredContent(DeferredContentNode {
                    value: Box::new(inner),
                    location,
                });
            }
        }
        Ok(Node::Assignment(assignment))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 12: TOP-DOWN INITIALIZATION
// ═══════════════════════════════════════════════════════════════════════════════

/// For values whose type is marked usable during initialization, the parent
/// must see the value before the value's own subtree initializes. The value
/// is bound to a compiler local inside the assignment; its initialization
/// moves to a manipulation that runs right after the assignment.
pub struct TopDownInitializationTransformer;

impl AstTransformer for TopDownInitializationTransformer {
    fn name(&self) -> &'static str {
        "top-down-initialization"
    }

    fn transform(
        &self,
        ctx: &mut TransformContext<'_>,
        _ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError> {
        let mut group = match node {
            Node::ManipulationGroup(g) => g,
            other => return Ok(other),
        };
        let mut rebuilt = Vec::with_capacity(group.children.len());
        for mut child in group.children.drain(..) {
            let mut trailing = Vec::new();
            if let Node::Assignment(a) = &mut child {
                for argument in a.arguments.iter_mut() {
                    if let Some(m) = split_top_down(ctx, argument) {
                        trailing.push(m);
                    }
                }
            }
            if let Node::MethodCall(c) = &mut child {
                for argument in c.arguments.iter_mut() {
                    if let Some(m) = split_top_down(ctx, argument) {
                        trailing.push(m);
                    }
                }
            }
            rebuilt.push(child);
            rebuilt.extend(trailing);
        }
        group.children = rebuilt;
        Ok(Node::ManipulationGroup(group))
    }
}

/// When `argument` is a construction-with-manipulations of a type marked
/// usable during initialization, bind it to a fresh local and return the
/// manipulation to run after the enclosing assignment.
fn split_top_down(ctx: &mut TransformContext<'_>, argument: &mut Node) -> Option<Node> {
    let applies = match argument {
        Node::ValueWithManipulations(v) => v
            .value
            .value_type()
            .map(|ty| has_attribute_in_hierarchy(&ty, &ctx.config.usable_during_init_attribute))
            .unwrap_or(false),
        _ => false,
    };
    if !applies {
        return None;
    }
    let location = argument.location();
    let Node::ValueWithManipulations(v) = std::mem::replace(
        argument,
        Node::Placeholder(crate::ast::PlaceholderNode {
            description: "top-down value in flight".to_string(),
            location,
        }),
    ) else {
        return None;
    };
    let local_id = ctx.next_local_id();
    *argument = Node::LocalValue(LocalValueNode {
        local_id,
        value: v.value,
        location,
    });
    Some(Node::LocalManipulation(LocalManipulationNode {
        local_id,
        manipulation: v.manipulation,
        location,
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 13: FLATTENING
// ═══════════════════════════════════════════════════════════════════════════════

/// Splices nested manipulation groups and collapses single-child groups.
/// Running the pass twice yields the same tree.
pub struct FlattenGroupsTransformer;

impl AstTransformer for FlattenGroupsTransformer {
    fn name(&self) -> &'static str {
        "flatten-groups"
    }

    fn transform(
        &self,
        _ctx: &mut TransformContext<'_>,
        _ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError> {
        let mut group = match node {
            Node::ManipulationGroup(g) => g,
            other => return Ok(other),
        };
        while group
            .children
            .iter()
            .any(|c| matches!(c, Node::ManipulationGroup(_)))
        {
            let mut spliced = Vec::with_capacity(group.children.len());
            for child in group.children.drain(..) {
                match child {
                    Node::ManipulationGroup(inner) => spliced.extend(inner.children),
                    other => spliced.push(other),
                }
            }
            group.children = spliced;
        }
        if group.children.len() == 1 {
            return Ok(group.children.pop().unwrap_or(Node::ManipulationGroup(group)));
        }
        Ok(Node::ManipulationGroup(group))
    }
}
