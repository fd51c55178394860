//! Content resolution and assignment conversion.
//!
//! Three pipeline passes. Content-property resolution gathers loose value
//! children under the type's declared content property. Assignment
//! conversion turns each property-value block into concrete assignment or
//! method-call manipulations, running setter selection per value. The
//! new-object pass resolves constructors and folds an element's
//! manipulations into a construction expression.
//!
//! Setter selection, per call site:
//!
//! 1. Arity filter: candidate parameter count equals the argument count.
//! 2. Repeat filter: assignments after the first keep only candidates that
//!    allow multiple application.
//! 3. Null filter: a null final argument keeps only null-accepting
//!    candidates.
//! 4. Key narrowing: each non-final argument removes every candidate it
//!    fails to convert for; surviving candidates demanding conflicting key
//!    conversions are an ambiguity error.
//! 5. Final argument: candidates reachable through a strengthening text
//!    conversion outrank plain direct matches. Several surviving direct
//!    matches are legal; emission applies the first statically assignable
//!    one.
//! 6. No survivors: fall back to an `Add` method on the enclosing object,
//!    then report the binding failure.

use crate::ast::{
    AssignmentNode, ClrPropertyReference, ManipulationGroupNode, MethodCallNode, NewObjectNode,
    Node, ObjectInitializationNode, PropertyValueNode, SourceLocation,
    ValueWithManipulationsNode,
};
use crate::diagnostics::{
    CompilerError, ERR_BIND_AMBIGUOUS, ERR_BIND_CONSTRUCTOR, ERR_BIND_MULTIPLE,
    ERR_BIND_NO_SETTER, ERR_PARSE_DIRECTIVE, ERR_PROPERTY_UNRESOLVED,
};
use crate::resolver::{collection_adders, resolve_regular_property};
use crate::transform::{
    is_strengthening_conversion, try_convert_value, AstTransformer, TransformContext,
    DIRECTIVE_KEY, DIRECTIVE_NAME,
};
use crate::types::{all_properties, PropertySetter, ResolvedProperty, XamlConstructor, XamlType};
use crate::visitor::AncestorInfo;

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 6: CONTENT PROPERTY RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ContentPropertyTransformer;

impl AstTransformer for ContentPropertyTransformer {
    fn name(&self) -> &'static str {
        "content-property"
    }

    fn transform(
        &self,
        ctx: &mut TransformContext<'_>,
        _ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError> {
        let mut obj = match node {
            Node::Object(o) => o,
            other => return Ok(other),
        };
        let ty = match obj.type_reference.as_ref() {
            Node::ClrType(t) => t.ty.clone(),
            _ => return Ok(Node::Object(obj)),
        };
        if !obj.children.iter().any(|c| c.is_value()) {
            return Ok(Node::Object(obj));
        }
        let Some(content_name) = content_property_name(&ty, &ctx.config.content_attribute) else {
            // Loose values without a content property fall through to the
            // new-object pass, which tries the owner's Add method.
            return Ok(Node::Object(obj));
        };

        let Some(property) = all_properties(&ty)
            .into_iter()
            .find(|p| p.name() == content_name)
        else {
            return Err(ctx.error(
                ERR_PROPERTY_UNRESOLVED,
                &format!(
                    "content attribute on '{}' names missing property '{}'",
                    ty.full_name(),
                    content_name
                ),
                obj.location,
            ));
        };
        let resolved = resolve_regular_property(&property, &ty);

        let mut rebuilt = Vec::with_capacity(obj.children.len());
        let mut values = Vec::new();
        let mut insert_at = None;
        for child in obj.children.drain(..) {
            if child.is_value() {
                if insert_at.is_none() {
                    insert_at = Some(rebuilt.len());
                }
                values.push(child);
            } else {
                rebuilt.push(child);
            }
        }
        let location = values
            .first()
            .map(|v| v.location())
            .unwrap_or(obj.location);
        rebuilt.insert(
            insert_at.unwrap_or(rebuilt.len()),
            Node::PropertyValue(PropertyValueNode {
                property: Box::new(Node::ClrProperty(ClrPropertyReference {
                    property: resolved,
                    location,
                })),
                values,
                location,
            }),
        );
        obj.children = rebuilt;
        Ok(Node::Object(obj))
    }
}

/// The content-property name declared by the marker attribute, searched up
/// the base chain.
pub fn content_property_name(ty: &XamlType, attribute: &str) -> Option<String> {
    let mut cursor = Some(ty.clone());
    while let Some(t) = cursor {
        if let Some(attr) = t.find_attribute(attribute) {
            return attr.arguments.first().cloned();
        }
        cursor = t.base_type();
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 7: KEY EXTRACTION & ASSIGNMENT CONVERSION
// ═══════════════════════════════════════════════════════════════════════════════

pub struct PropertyAssignmentTransformer;

impl AstTransformer for PropertyAssignmentTransformer {
    fn name(&self) -> &'static str {
        "property-assignments"
    }

    fn transform(
        &self,
        ctx: &mut TransformContext<'_>,
        ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError> {
        let pv = match node {
            Node::PropertyValue(p) => p,
            other => return Ok(other),
        };
        let resolved = match pv.property.as_ref() {
            Node::ClrProperty(p) => p.property.clone(),
            // Unresolved reference surviving in non-strict mode.
            _ => return Ok(Node::PropertyValue(pv)),
        };

        let owner = ancestors.iter().rev().find_map(|a| a.object_type.clone());
        let mut manipulations = Vec::with_capacity(pv.values.len());
        for (index, mut value) in pv.values.into_iter().enumerate() {
            let key = extract_key(ctx, &mut value);
            let mut arguments: Vec<Node> = key.into_iter().collect();
            arguments.push(value);
            manipulations.push(select_assignment(
                ctx,
                owner.as_ref(),
                &resolved,
                arguments,
                index,
                pv.location,
            )?);
        }
        if manipulations.len() == 1 {
            Ok(manipulations.pop().unwrap_or(Node::ManipulationGroup(
                ManipulationGroupNode {
                    children: vec![],
                    location: pv.location,
                },
            )))
        } else {
            Ok(Node::ManipulationGroup(ManipulationGroupNode {
                children: manipulations,
                location: pv.location,
            }))
        }
    }
}

/// Detach a `Key` directive from a value subtree, descending through the
/// wrapper shapes a value may already carry.
pub fn extract_key(ctx: &TransformContext<'_>, value: &mut Node) -> Option<Node> {
    match value {
        Node::Object(obj) => {
            let position = obj.children.iter().position(|c| {
                matches!(
                    c,
                    Node::Directive(d)
                        if d.name == DIRECTIVE_KEY && ctx.is_markup_namespace(&d.namespace)
                )
            })?;
            match obj.children.remove(position) {
                Node::Directive(d) => d.values.into_iter().next(),
                _ => None,
            }
        }
        Node::ValueWithManipulations(v) => extract_key(ctx, &mut v.value)
            .or_else(|| extract_key(ctx, &mut v.manipulation)),
        Node::ObjectInitialization(o) => extract_key(ctx, &mut o.manipulation),
        Node::ManipulationGroup(g) => {
            g.children.iter_mut().find_map(|c| extract_key(ctx, c))
        }
        Node::LocalValue(l) => extract_key(ctx, &mut l.value),
        _ => None,
    }
}

/// Run setter selection for one assignment call site and build the
/// resulting manipulation node.
pub fn select_assignment(
    ctx: &TransformContext<'_>,
    owner: Option<&XamlType>,
    property: &ResolvedProperty,
    mut arguments: Vec<Node>,
    assignment_index: usize,
    location: SourceLocation,
) -> Result<Node, CompilerError> {
    let wk = ctx.well_known;
    let mut candidates: Vec<PropertySetter> = property
        .setters
        .iter()
        .filter(|s| s.parameters.len() == arguments.len())
        .cloned()
        .collect();

    if assignment_index > 0 {
        let had_any = !candidates.is_empty();
        candidates.retain(|s| s.allow_multiple);
        if candidates.is_empty() && had_any {
            return Err(ctx.error(
                ERR_BIND_MULTIPLE,
                &format!(
                    "property '{}' is assigned more than once but none of its setters allow repeated assignment",
                    property.name()
                ),
                location,
            ));
        }
    }

    let final_index = arguments.len() - 1;
    if matches!(arguments[final_index], Node::Null(_)) {
        candidates.retain(|s| s.allow_null);
    }

    // Key narrowing: a candidate that cannot convert a non-final argument
    // is removed; the survivors must agree on one conversion.
    for i in 0..final_index {
        let mut agreed: Option<Node> = None;
        let mut conflicting = false;
        candidates.retain(|s| match try_convert_value(&arguments[i], &s.parameters[i], wk) {
            Some(converted) => {
                match &agreed {
                    None => agreed = Some(converted),
                    Some(prev) => {
                        let prev_ty = prev.value_type_or(&wk.string);
                        let next_ty = converted.value_type_or(&wk.string);
                        if prev_ty != next_ty {
                            conflicting = true;
                        }
                    }
                }
                true
            }
            None => false,
        });
        if conflicting {
            return Err(ctx.error(
                ERR_BIND_AMBIGUOUS,
                &format!(
                    "key argument for property '{}' converts differently across surviving setters",
                    property.name()
                ),
                location,
            ));
        }
        if let Some(converted) = agreed {
            arguments[i] = converted;
        }
    }

    // Final argument: strengthening conversions outrank direct matches.
    let strengthened: Vec<PropertySetter> = candidates
        .iter()
        .filter(|s| {
            s.parameters
                .last()
                .map(|p| is_strengthening_conversion(&arguments[final_index], p, wk))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if !strengthened.is_empty() {
        candidates = strengthened;
    } else {
        candidates.retain(|s| {
            s.parameters
                .last()
                .map(|p| try_convert_value(&arguments[final_index], p, wk).is_some())
                .unwrap_or(false)
        });
    }

    if let Some(first) = candidates.first() {
        if let Some(target) = first.parameters.last() {
            if let Some(converted) = try_convert_value(&arguments[final_index], target, wk) {
                arguments[final_index] = converted;
            }
        }
        return Ok(Node::Assignment(AssignmentNode {
            property: property.clone(),
            setters: candidates,
            arguments,
            location,
        }));
    }

    // No setter candidate survived. A single plain value may still go
    // through the enclosing object's Add method.
    if arguments.len() == 1 {
        if let Some(owner) = owner {
            for add in collection_adders(owner) {
                if add.parameters().len() != 1 {
                    continue;
                }
                if let Some(converted) =
                    try_convert_value(&arguments[0], &add.parameters()[0], wk)
                {
                    return Ok(Node::MethodCall(MethodCallNode {
                        method: add,
                        arguments: vec![converted],
                        location,
                    }));
                }
            }
        }
    }

    Err(ctx.error(
        ERR_BIND_NO_SETTER,
        &format!(
            "no setter or adder on '{}.{}' accepts the given value",
            property.declaring_type.full_name(),
            property.name()
        ),
        location,
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 8: NEW-OBJECT RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════════

pub struct NewObjectTransformer;

impl AstTransformer for NewObjectTransformer {
    fn name(&self) -> &'static str {
        "new-objects"
    }

    fn transform(
        &self,
        ctx: &mut TransformContext<'_>,
        _ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError> {
        let mut obj = match node {
            Node::Object(o) => o,
            other => return Ok(other),
        };
        let ty = match obj.type_reference.as_ref() {
            Node::ClrType(t) => t.ty.clone(),
            _ => return Ok(Node::Object(obj)),
        };
        // Value types and strings construct from text, in a later pass.
        if ty.is_value_type() || ty == ctx.well_known.string {
            return Ok(Node::Object(obj));
        }

        let mut manipulations = Vec::new();
        let mut name_value: Option<Node> = None;
        for child in obj.children.drain(..) {
            match child {
                m if m.is_manipulation() => manipulations.push(m),
                Node::Directive(d)
                    if d.name == DIRECTIVE_NAME && ctx.is_markup_namespace(&d.namespace) =>
                {
                    name_value = d.values.into_iter().next();
                }
                Node::Directive(d) => {
                    if ctx.strict() {
                        return Err(ctx.error(
                            ERR_PARSE_DIRECTIVE,
                            &format!("directive '{}' is not valid here", d.name),
                            d.location,
                        ));
                    }
                    tracing::debug!(directive = %d.name, "dropping unsupported directive");
                }
                Node::Placeholder(_) => {}
                value if value.is_value() => {
                    // Loose value with no content property: the object's own
                    // Add method is the last resort.
                    let location = value.location();
                    let added = collection_adders(&ty).into_iter().find_map(|add| {
                        if add.parameters().len() != 1 {
                            return None;
                        }
                        try_convert_value(&value, &add.parameters()[0], ctx.well_known).map(
                            |converted| {
                                Node::MethodCall(MethodCallNode {
                                    method: add,
                                    arguments: vec![converted],
                                    location,
                                })
                            },
                        )
                    });
                    match added {
                        Some(call) => manipulations.push(call),
                        None => {
                            return Err(ctx.error(
                                ERR_BIND_NO_SETTER,
                                &format!(
                                    "'{}' has no content property and no Add method accepting {}",
                                    ty.full_name(),
                                    value.describe()
                                ),
                                location,
                            ))
                        }
                    }
                }
                other => {
                    return Err(ctx.error(
                        ERR_PARSE_DIRECTIVE,
                        &format!("unexpected {} inside object element", other.describe()),
                        other.location(),
                    ))
                }
            }
        }

        if let Some(name) = name_value {
            match named_assignment(ctx, &ty, name, obj.location)? {
                Some(assignment) => manipulations.insert(0, assignment),
                None => {
                    tracing::debug!(ty = %ty.full_name(), "type has no settable Name property, dropping x:Name");
                }
            }
        }

        let (constructor, arguments) =
            resolve_constructor(ctx, &ty, std::mem::take(&mut obj.arguments), obj.location)?;
        let value = Node::NewObject(NewObjectNode {
            ty: ty.clone(),
            constructor,
            arguments,
            location: obj.location,
        });
        if manipulations.is_empty() {
            return Ok(value);
        }
        Ok(Node::ValueWithManipulations(ValueWithManipulationsNode {
            value: Box::new(value),
            manipulation: Box::new(Node::ObjectInitialization(ObjectInitializationNode {
                ty,
                manipulation: Box::new(Node::ManipulationGroup(ManipulationGroupNode {
                    children: manipulations,
                    location: obj.location,
                })),
                location: obj.location,
            })),
            location: obj.location,
        }))
    }
}

fn named_assignment(
    ctx: &TransformContext<'_>,
    ty: &XamlType,
    name: Node,
    location: SourceLocation,
) -> Result<Option<Node>, CompilerError> {
    let Some(property) = all_properties(ty)
        .into_iter()
        .find(|p| p.name() == "Name" && p.setter().is_some())
    else {
        return Ok(None);
    };
    let resolved = resolve_regular_property(&property, ty);
    Ok(Some(select_assignment(
        ctx,
        Some(ty),
        &resolved,
        vec![name],
        0,
        location,
    )?))
}

/// Pick a public constructor by arity, converting each argument. Candidates
/// are tried in declaration order; the first fully convertible one wins.
fn resolve_constructor(
    ctx: &TransformContext<'_>,
    ty: &XamlType,
    arguments: Vec<Node>,
    location: SourceLocation,
) -> Result<(XamlConstructor, Vec<Node>), CompilerError> {
    let candidates: Vec<XamlConstructor> = ty
        .constructors()
        .into_iter()
        .filter(|c| c.is_public() && c.parameters().len() == arguments.len())
        .collect();
    for ctor in &candidates {
        let mut converted = Vec::with_capacity(arguments.len());
        let mut ok = true;
        for (argument, parameter) in arguments.iter().zip(ctor.parameters()) {
            match try_convert_value(argument, &parameter, ctx.well_known) {
                Some(c) => converted.push(c),
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            return Ok((ctor.clone(), converted));
        }
    }
    Err(ctx.error(
        ERR_BIND_CONSTRUCTOR,
        &format!(
            "'{}' has no public constructor taking {} convertible argument(s)",
            ty.full_name(),
            arguments.len()
        ),
        location,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ClrTypeReference, DirectiveNode, ObjectNode, TextNode};
    use crate::transform::{CompilerConfig, MARKUP_NAMESPACE};
    use crate::types::{
        InMemoryTypeSystem, SetterKind, TypeBuilder, TypeKind, TypeSystem, WellKnownTypes,
    };
    use std::collections::HashMap;

    struct Fixture {
        ts: InMemoryTypeSystem,
        config: CompilerConfig,
        aliases: HashMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                ts: InMemoryTypeSystem::with_core_types(),
                config: CompilerConfig::new(),
                aliases: HashMap::new(),
            }
        }
    }

    fn text(s: &str) -> Node {
        Node::Text(TextNode {
            text: s.to_string(),
            ty: None,
            location: SourceLocation::default(),
        })
    }

    fn setter(kind: SetterKind, parameters: Vec<XamlType>, allow_multiple: bool) -> PropertySetter {
        let allow_null = parameters
            .last()
            .map(|p| !p.is_value_type())
            .unwrap_or(false);
        PropertySetter {
            kind,
            parameters,
            allow_null,
            allow_multiple,
        }
    }

    #[test]
    fn content_property_wraps_loose_values() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let string = f.ts.find_type("System.String").unwrap();
        let panel = f
            .ts
            .define_type("App", "App", "Panel", TypeKind::Class, Some(&object));
        f.ts.add_auto_property(&panel, "Content", &string, true, true);
        f.ts.add_type_attribute(
            &panel,
            &f.config.content_attribute,
            vec!["Content".to_string()],
        );
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let mut ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        let tree = Node::Object(ObjectNode {
            type_reference: Box::new(Node::ClrType(ClrTypeReference {
                ty: panel,
                location: SourceLocation::default(),
            })),
            arguments: vec![],
            children: vec![text("hello")],
            location: SourceLocation::default(),
        });
        let out = ContentPropertyTransformer
            .transform(&mut ctx, &[], tree)
            .unwrap();
        let Node::Object(obj) = out else { panic!() };
        match &obj.children[0] {
            Node::PropertyValue(pv) => {
                assert_eq!(pv.values.len(), 1);
                match pv.property.as_ref() {
                    Node::ClrProperty(p) => assert_eq!(p.property.name(), "Content"),
                    other => panic!("unexpected {:?}", other.kind()),
                }
            }
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn text_argument_prefers_strengthened_setter() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let string = f.ts.find_type("System.String").unwrap();
        let int32 = f.ts.find_type("System.Int32").unwrap();
        let void = f.ts.find_type("System.Void").unwrap();
        let owner = f
            .ts
            .define_type("App", "App", "Owner", TypeKind::Class, Some(&object));
        let set_str = f.ts.define_method(&owner, "set_Value", &void, &[string.clone()], false);
        let set_int = f.ts.define_method(&owner, "set_Value2", &void, &[int32.clone()], false);
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        let property = ResolvedProperty {
            name: "Value".to_string(),
            declaring_type: owner.clone(),
            value_type: string.clone(),
            getter: None,
            setters: vec![
                setter(SetterKind::Instance(set_str), vec![string.clone()], false),
                setter(SetterKind::Instance(set_int), vec![int32.clone()], false),
            ],
            attributes: vec![],
        };
        let out = select_assignment(
            &ctx,
            Some(&owner),
            &property,
            vec![text("42")],
            0,
            SourceLocation::default(),
        )
        .unwrap();
        let Node::Assignment(a) = out else { panic!() };
        assert_eq!(a.setters.len(), 1);
        assert_eq!(a.setters[0].parameters[0], int32);
        match &a.arguments[0] {
            Node::Text(t) => assert_eq!(t.ty.as_ref(), Some(&int32)),
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn ambiguous_key_conversion_removes_failing_setter() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let string = f.ts.find_type("System.String").unwrap();
        let int32 = f.ts.find_type("System.Int32").unwrap();
        let void = f.ts.find_type("System.Void").unwrap();
        let dict = f
            .ts
            .define_type("App", "App", "Resources", TypeKind::Class, Some(&object));
        let get = f.ts.define_method(&dict, "get_Items", &dict, &[], false);
        let add_int = f.ts.define_method(&dict, "AddByIndex", &void, &[int32.clone(), object.clone()], false);
        let add_str = f.ts.define_method(&dict, "AddByName", &void, &[string.clone(), object.clone()], false);
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        let property = ResolvedProperty {
            name: "Items".to_string(),
            declaring_type: dict.clone(),
            value_type: object.clone(),
            getter: Some(get.clone()),
            setters: vec![
                setter(
                    SetterKind::Adder { getter: get.clone(), add: add_int },
                    vec![int32.clone(), object.clone()],
                    true,
                ),
                setter(
                    SetterKind::Adder { getter: get, add: add_str },
                    vec![string.clone(), object.clone()],
                    true,
                ),
            ],
            attributes: vec![],
        };

        // A non-numeric key fails the int candidate; only the failing
        // candidate is removed and the string adder survives.
        let out = select_assignment(
            &ctx,
            Some(&dict),
            &property,
            vec![text("brush"), text("v")],
            0,
            SourceLocation::default(),
        )
        .unwrap();
        let Node::Assignment(a) = out else { panic!() };
        assert_eq!(a.setters.len(), 1);
        assert_eq!(a.setters[0].parameters[0], string);

        // A numeric key converts both ways, which is an ambiguity.
        let err = select_assignment(
            &ctx,
            Some(&dict),
            &property,
            vec![text("42"), text("v")],
            0,
            SourceLocation::default(),
        )
        .unwrap_err();
        assert_eq!(err.code, ERR_BIND_AMBIGUOUS);
    }

    #[test]
    fn repeated_assignment_requires_multi_capable_setter() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let string = f.ts.find_type("System.String").unwrap();
        let void = f.ts.find_type("System.Void").unwrap();
        let owner = f
            .ts
            .define_type("App", "App", "Owner", TypeKind::Class, Some(&object));
        let set = f.ts.define_method(&owner, "set_Title", &void, &[string.clone()], false);
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        let property = ResolvedProperty {
            name: "Title".to_string(),
            declaring_type: owner.clone(),
            value_type: string.clone(),
            getter: None,
            setters: vec![setter(SetterKind::Instance(set), vec![string], false)],
            attributes: vec![],
        };
        let err = select_assignment(
            &ctx,
            Some(&owner),
            &property,
            vec![text("second")],
            1,
            SourceLocation::default(),
        )
        .unwrap_err();
        assert_eq!(err.code, ERR_BIND_MULTIPLE);
    }

    #[test]
    fn setterless_property_falls_back_to_owner_add() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let void = f.ts.find_type("System.Void").unwrap();
        let item = f
            .ts
            .define_type("App", "App", "Item", TypeKind::Class, Some(&object));
        f.ts.define_constructor(&item, &[]);
        let root = f
            .ts
            .define_type("App", "App", "Root", TypeKind::Class, Some(&object));
        let add = f.ts.define_method(&root, "Add", &void, &[item.clone()], false);
        f.ts.add_auto_property(&root, "Items", &object, true, false);
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        // Items has a getter returning plain object: no adders, no setter.
        let property = ResolvedProperty {
            name: "Items".to_string(),
            declaring_type: root.clone(),
            value_type: object.clone(),
            getter: None,
            setters: vec![],
            attributes: vec![],
        };
        let ctor = item.constructors().into_iter().next().unwrap();
        let value = Node::NewObject(NewObjectNode {
            ty: item,
            constructor: ctor,
            arguments: vec![],
            location: SourceLocation::default(),
        });
        let out = select_assignment(
            &ctx,
            Some(&root),
            &property,
            vec![value],
            0,
            SourceLocation::default(),
        )
        .unwrap();
        let Node::MethodCall(call) = out else { panic!() };
        assert_eq!(call.method, add);
    }

    #[test]
    fn key_directive_is_extracted_from_object_values() {
        let f = Fixture::new();
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");
        let object = f.ts.find_type("System.Object").unwrap();

        let mut value = Node::Object(ObjectNode {
            type_reference: Box::new(Node::ClrType(ClrTypeReference {
                ty: object,
                location: SourceLocation::default(),
            })),
            arguments: vec![],
            children: vec![Node::Directive(DirectiveNode {
                namespace: MARKUP_NAMESPACE.to_string(),
                name: DIRECTIVE_KEY.to_string(),
                values: vec![text("k1")],
                location: SourceLocation::default(),
            })],
            location: SourceLocation::default(),
        });
        let key = extract_key(&ctx, &mut value).unwrap();
        match key {
            Node::Text(t) => assert_eq!(t.text, "k1"),
            other => panic!("unexpected {:?}", other.kind()),
        }
        let Node::Object(obj) = value else { panic!() };
        assert!(obj.children.is_empty());
    }

    #[test]
    fn object_with_manipulations_becomes_initialization_plan() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let string = f.ts.find_type("System.String").unwrap();
        let button = f
            .ts
            .define_type("App", "App", "Button", TypeKind::Class, Some(&object));
        f.ts.define_constructor(&button, &[]);
        let property = f.ts.add_auto_property(&button, "Text", &string, true, true);
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let mut ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        let resolved = resolve_regular_property(&property, &button);
        let assignment = select_assignment(
            &ctx,
            Some(&button),
            &resolved,
            vec![text("hi")],
            0,
            SourceLocation::default(),
        )
        .unwrap();
        let tree = Node::Object(ObjectNode {
            type_reference: Box::new(Node::ClrType(ClrTypeReference {
                ty: button.clone(),
                location: SourceLocation::default(),
            })),
            arguments: vec![],
            children: vec![assignment],
            location: SourceLocation::default(),
        });
        let out = NewObjectTransformer.transform(&mut ctx, &[], tree).unwrap();
        let Node::ValueWithManipulations(v) = out else { panic!() };
        assert!(matches!(v.value.as_ref(), Node::NewObject(n) if n.ty == button));
        match v.manipulation.as_ref() {
            Node::ObjectInitialization(init) => {
                assert_eq!(init.ty, button);
                match init.manipulation.as_ref() {
                    Node::ManipulationGroup(g) => assert_eq!(g.children.len(), 1),
                    other => panic!("unexpected {:?}", other.kind()),
                }
            }
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn missing_constructor_is_reported() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let silent = f
            .ts
            .define_type("App", "App", "NoCtor", TypeKind::Class, Some(&object));
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let mut ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        let tree = Node::Object(ObjectNode {
            type_reference: Box::new(Node::ClrType(ClrTypeReference {
                ty: silent,
                location: SourceLocation::default(),
            })),
            arguments: vec![text("arg")],
            children: vec![],
            location: SourceLocation::default(),
        });
        let err = NewObjectTransformer
            .transform(&mut ctx, &[], tree)
            .unwrap_err();
        assert_eq!(err.code, ERR_BIND_CONSTRUCTOR);
    }
}
