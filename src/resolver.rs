//! Reference resolution: XML names to metadata handles.
//!
//! Two pipeline passes live here. Type-reference resolution derives CLR
//! namespace candidates from the XML namespace (via the configured mapping
//! or an inline `clr-namespace:` URI), probes the `Extension` suffix in the
//! order the reference's context dictates, and applies generic-argument
//! substitution. Property-reference resolution picks between ordinary
//! members and the attached-property accessor triad.
//!
//! Unresolved names are errors in strict mode; in non-strict mode the
//! unresolved node stays in place for a later pass or surfaces at emission.

use crate::ast::{ClrPropertyReference, ClrTypeReference, Node, XmlTypeReference};
use crate::diagnostics::{CompilerError, ERR_PROPERTY_UNRESOLVED, ERR_TYPE_UNRESOLVED};
use crate::transform::{AstTransformer, ClrNamespaceBinding, TransformContext};
use crate::types::{
    all_events, all_methods, all_properties, PropertySetter, ResolvedProperty, SetterKind,
    XamlMethod, XamlProperty, XamlType,
};
use crate::visitor::AncestorInfo;
use lazy_static::lazy_static;
use regex::Regex;

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 4: TYPE REFERENCE RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════════

pub struct TypeReferenceResolver;

impl AstTransformer for TypeReferenceResolver {
    fn name(&self) -> &'static str {
        "type-references"
    }

    fn transform(
        &self,
        ctx: &mut TransformContext<'_>,
        _ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError> {
        let reference = match node {
            Node::XmlType(r) => r,
            other => return Ok(other),
        };
        match resolve_type_reference(ctx, &reference)? {
            Some(ty) => Ok(Node::ClrType(ClrTypeReference {
                ty,
                location: reference.location,
            })),
            None if ctx.strict() => Err(ctx.error(
                ERR_TYPE_UNRESOLVED,
                &format!(
                    "unable to resolve type '{}' in namespace '{}'",
                    reference.name, reference.xml_namespace
                ),
                reference.location,
            )),
            None => Ok(Node::XmlType(reference)),
        }
    }
}

/// Resolve one XML type reference against the configured namespace map.
/// Returns `Ok(None)` when the name simply does not resolve; hard errors
/// are reserved for structurally invalid references.
pub fn resolve_type_reference(
    ctx: &TransformContext<'_>,
    reference: &XmlTypeReference,
) -> Result<Option<XamlType>, CompilerError> {
    // Generic arguments resolve first; an unresolvable argument makes the
    // whole reference unresolvable.
    let mut arguments = Vec::new();
    for arg in &reference.generic_arguments {
        let resolved = match arg {
            Node::ClrType(t) => Some(t.ty.clone()),
            Node::XmlType(r) => resolve_type_reference(ctx, r)?,
            _ => None,
        };
        match resolved {
            Some(t) => arguments.push(t),
            None => return Ok(None),
        }
    }

    // Markup-extension contexts probe the Extension-suffixed spelling
    // first; everything else probes the bare name first.
    let bare = reference.name.clone();
    let suffixed = format!("{}Extension", reference.name);
    let candidates = if reference.prefer_extension {
        [suffixed, bare]
    } else {
        [bare, suffixed]
    };

    let inline = parse_clr_namespace_uri(&reference.xml_namespace);
    let bindings: Vec<ClrNamespaceBinding> = match &inline {
        Some(binding) => vec![binding.clone()],
        None => ctx
            .config
            .namespace_map
            .get(&reference.xml_namespace)
            .cloned()
            .unwrap_or_default(),
    };

    for binding in &bindings {
        for candidate in &candidates {
            let plain = format!("{}.{}", binding.clr_namespace, candidate);
            let spelled = if arguments.is_empty() {
                plain
            } else {
                format!("{}`{}", plain, arguments.len())
            };
            let found = match &binding.assembly {
                Some(asm) => ctx.type_system.find_type_in(asm, &spelled),
                None => ctx.type_system.find_type(&spelled),
            };
            if let Some(ty) = found {
                if arguments.is_empty() {
                    return Ok(Some(ty));
                }
                if let Some(instance) = ctx.type_system.make_generic(&ty, &arguments) {
                    return Ok(Some(instance));
                }
            }
        }
    }
    Ok(None)
}

/// `clr-namespace:Some.Ns;assembly=SomeAsm` inline namespace syntax.
lazy_static! {
    static ref CLR_NAMESPACE_URI: Regex =
        Regex::new(r"^clr-namespace:([^;]+)(?:;assembly=(.+))?$").unwrap();
}

fn parse_clr_namespace_uri(uri: &str) -> Option<ClrNamespaceBinding> {
    let captures = CLR_NAMESPACE_URI.captures(uri)?;
    Some(ClrNamespaceBinding {
        clr_namespace: captures.get(1)?.as_str().to_string(),
        assembly: captures.get(2).map(|m| m.as_str().to_string()),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 5: PROPERTY REFERENCE RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════════

pub struct PropertyReferenceResolver;

impl AstTransformer for PropertyReferenceResolver {
    fn name(&self) -> &'static str {
        "property-references"
    }

    fn transform(
        &self,
        ctx: &mut TransformContext<'_>,
        _ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError> {
        let reference = match node {
            Node::NameProperty(r) => r,
            other => return Ok(other),
        };
        let (declaring, target) = match (
            reference.declaring_type.as_ref(),
            reference.target_type.as_ref(),
        ) {
            (Node::ClrType(d), Node::ClrType(t)) => (d.ty.clone(), t.ty.clone()),
            // Type resolution left these unresolved (non-strict); leave the
            // property reference unresolved too.
            _ => return Ok(Node::NameProperty(reference)),
        };

        if let Some(resolved) =
            resolve_property(ctx, &declaring, &target, &reference.name)
        {
            return Ok(Node::ClrProperty(ClrPropertyReference {
                property: resolved,
                location: reference.location,
            }));
        }
        if ctx.strict() {
            return Err(ctx.error(
                ERR_PROPERTY_UNRESOLVED,
                &format!(
                    "type '{}' has no property, event, or attached accessor pair named '{}'",
                    declaring.full_name(),
                    reference.name
                ),
                reference.location,
            ));
        }
        Ok(Node::NameProperty(reference))
    }
}

/// Resolution order: regular instance property or add-capable event when
/// the target and declaring types are related; otherwise the static
/// attached triad `Get<Name>` / `Set<Name>` / `Add<Name>Handler`.
pub fn resolve_property(
    ctx: &TransformContext<'_>,
    declaring: &XamlType,
    target: &XamlType,
    name: &str,
) -> Option<ResolvedProperty> {
    if declaring.is_assignable_from(target) || target.is_assignable_from(declaring) {
        if let Some(property) = all_properties(declaring)
            .into_iter()
            .find(|p| p.name() == name)
        {
            return Some(resolve_regular_property(&property, declaring));
        }
        if let Some(event) = all_events(declaring).into_iter().find(|e| e.name() == name) {
            let add = event.add_method();
            let handler = add.parameters().into_iter().next()?;
            return Some(ResolvedProperty {
                name: name.to_string(),
                declaring_type: declaring.clone(),
                value_type: handler.clone(),
                getter: None,
                setters: vec![PropertySetter {
                    kind: SetterKind::EventAdd(add),
                    parameters: vec![handler],
                    allow_null: false,
                    allow_multiple: true,
                }],
                attributes: Vec::new(),
            });
        }
        return None;
    }
    resolve_attached_property(ctx, declaring, target, name)
}

/// Build the full setter-candidate list for an ordinary property:
/// the instance setter plus every collection adder reachable through the
/// getter.
pub fn resolve_regular_property(
    property: &XamlProperty,
    declaring: &XamlType,
) -> ResolvedProperty {
    let mut setters = Vec::new();
    if let Some(set) = property.setter() {
        let value_type = property.property_type();
        setters.push(PropertySetter {
            kind: SetterKind::Instance(set),
            parameters: vec![value_type.clone()],
            allow_null: !value_type.is_value_type(),
            allow_multiple: false,
        });
    }
    if let Some(getter) = property.getter() {
        for add in collection_adders(&property.property_type()) {
            let parameters = add.parameters();
            let last_is_ref = parameters
                .last()
                .map(|p| !p.is_value_type())
                .unwrap_or(false);
            setters.push(PropertySetter {
                kind: SetterKind::Adder {
                    getter: getter.clone(),
                    add,
                },
                parameters,
                allow_null: last_is_ref,
                allow_multiple: true,
            });
        }
    }
    ResolvedProperty {
        name: property.name().to_string(),
        declaring_type: declaring.clone(),
        value_type: property.property_type(),
        getter: property.getter(),
        setters,
        attributes: property.attributes(),
    }
}

/// Public instance `Add` methods with one or two parameters; two-parameter
/// adders carry dictionary key/value shape.
pub fn collection_adders(collection_type: &XamlType) -> Vec<XamlMethod> {
    all_methods(collection_type)
        .into_iter()
        .filter(|m| {
            m.name() == "Add"
                && !m.is_static()
                && m.is_public()
                && (1..=2).contains(&m.parameters().len())
        })
        .collect()
}

fn resolve_attached_property(
    _ctx: &TransformContext<'_>,
    declaring: &XamlType,
    target: &XamlType,
    name: &str,
) -> Option<ResolvedProperty> {
    let statics: Vec<XamlMethod> = all_methods(declaring)
        .into_iter()
        .filter(|m| m.is_static() && m.is_public())
        .collect();
    let accepts_target = |m: &XamlMethod| {
        m.parameters()
            .first()
            .map(|p| p.is_assignable_from(target))
            .unwrap_or(false)
    };

    let getter = statics
        .iter()
        .find(|m| m.name() == format!("Get{}", name) && m.parameters().len() == 1 && accepts_target(m))
        .cloned();
    let setter = statics
        .iter()
        .find(|m| m.name() == format!("Set{}", name) && m.parameters().len() == 2 && accepts_target(m))
        .cloned();
    let adder = statics
        .iter()
        .find(|m| {
            m.name() == format!("Add{}Handler", name)
                && m.parameters().len() == 2
                && accepts_target(m)
        })
        .cloned();

    if setter.is_none() && getter.is_none() && adder.is_none() {
        return None;
    }

    let mut setters = Vec::new();
    let mut value_type = None;
    if let Some(set) = &setter {
        let vt = set.parameters().into_iter().nth(1)?;
        setters.push(PropertySetter {
            kind: SetterKind::AttachedStatic(set.clone()),
            parameters: vec![vt.clone()],
            allow_null: !vt.is_value_type(),
            allow_multiple: false,
        });
        value_type = Some(vt);
    }
    if let Some(add) = &adder {
        let handler = add.parameters().into_iter().nth(1)?;
        setters.push(PropertySetter {
            kind: SetterKind::AttachedStatic(add.clone()),
            parameters: vec![handler.clone()],
            allow_null: false,
            allow_multiple: true,
        });
        value_type.get_or_insert(handler);
    }
    let value_type = value_type.or_else(|| getter.as_ref().map(|g| g.return_type()))?;

    Some(ResolvedProperty {
        name: name.to_string(),
        declaring_type: declaring.clone(),
        value_type,
        getter,
        setters,
        attributes: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SourceLocation;
    use crate::transform::{CompilerConfig, TransformContext};
    use crate::types::{InMemoryTypeSystem, TypeBuilder, TypeKind, TypeSystem, WellKnownTypes};
    use std::collections::HashMap;

    struct Fixture {
        ts: InMemoryTypeSystem,
        config: CompilerConfig,
        aliases: HashMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            let ts = InMemoryTypeSystem::with_core_types();
            let mut config = CompilerConfig::new();
            config.map_namespace("test", "TestApp.Controls", None);
            let mut aliases = HashMap::new();
            aliases.insert("".to_string(), "test".to_string());
            Fixture { ts, config, aliases }
        }
    }

    fn xml_ref(ns: &str, name: &str) -> XmlTypeReference {
        XmlTypeReference {
            xml_namespace: ns.to_string(),
            name: name.to_string(),
            generic_arguments: vec![],
            prefer_extension: false,
            location: SourceLocation::default(),
        }
    }

    #[test]
    fn resolves_type_through_namespace_map() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let button = f
            .ts
            .define_type("TestApp", "TestApp.Controls", "Button", TypeKind::Class, Some(&object));
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let mut ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        let out = TypeReferenceResolver
            .transform(&mut ctx, &[], Node::XmlType(xml_ref("test", "Button")))
            .unwrap();
        match out {
            Node::ClrType(t) => assert_eq!(t.ty, button),
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn round_trip_resolution_returns_identical_handle() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let button = f
            .ts
            .define_type("TestApp", "TestApp.Controls", "Button", TypeKind::Class, Some(&object));
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        // Re-resolving a reference rebuilt from the handle's own name must
        // return the same handle.
        let reference = xml_ref("test", button.name());
        let resolved = resolve_type_reference(&ctx, &reference).unwrap().unwrap();
        assert_eq!(resolved, button);
    }

    #[test]
    fn extension_suffix_probe_order() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let plain = f
            .ts
            .define_type("TestApp", "TestApp.Controls", "Static", TypeKind::Class, Some(&object));
        let suffixed = f.ts.define_type(
            "TestApp",
            "TestApp.Controls",
            "StaticExtension",
            TypeKind::Class,
            Some(&object),
        );
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        let mut reference = xml_ref("test", "Static");
        reference.prefer_extension = true;
        assert_eq!(
            resolve_type_reference(&ctx, &reference).unwrap().unwrap(),
            suffixed
        );
        reference.prefer_extension = false;
        assert_eq!(
            resolve_type_reference(&ctx, &reference).unwrap().unwrap(),
            plain
        );
    }

    #[test]
    fn strict_mode_rejects_unknown_type() {
        let f = Fixture::new();
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let mut ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");
        let err = TypeReferenceResolver
            .transform(&mut ctx, &[], Node::XmlType(xml_ref("test", "Missing")))
            .unwrap_err();
        assert_eq!(err.code, ERR_TYPE_UNRESOLVED);
    }

    #[test]
    fn non_strict_mode_leaves_unknown_type_in_place() {
        let f = Fixture::new();
        let mut config = f.config.clone();
        config.options.strict = false;
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let mut ctx = TransformContext::new(&config, &f.ts, &wk, &f.aliases, "t.xaml");
        let out = TypeReferenceResolver
            .transform(&mut ctx, &[], Node::XmlType(xml_ref("test", "Missing")))
            .unwrap();
        assert!(matches!(out, Node::XmlType(_)));
    }

    #[test]
    fn attached_triad_resolves_when_types_are_unrelated() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let int32 = f.ts.find_type("System.Int32").unwrap();
        let void = f.ts.find_type("System.Void").unwrap();
        let grid = f
            .ts
            .define_type("TestApp", "TestApp.Controls", "Grid", TypeKind::Class, Some(&object));
        let button = f
            .ts
            .define_type("TestApp", "TestApp.Controls", "Button", TypeKind::Class, Some(&object));
        f.ts.define_method(&grid, "GetRow", &int32, &[object.clone()], true);
        f.ts.define_method(&grid, "SetRow", &void, &[object.clone(), int32.clone()], true);
        let wk = WellKnownTypes::resolve(&f.ts).unwrap();
        let ctx = TransformContext::new(&f.config, &f.ts, &wk, &f.aliases, "t.xaml");

        let resolved = resolve_property(&ctx, &grid, &button, "Row").unwrap();
        assert_eq!(resolved.value_type, int32);
        assert_eq!(resolved.setters.len(), 1);
        assert!(matches!(
            resolved.setters[0].kind,
            SetterKind::AttachedStatic(_)
        ));
    }

    #[test]
    fn regular_property_collects_instance_setter_and_adders() {
        let f = Fixture::new();
        let object = f.ts.find_type("System.Object").unwrap();
        let string = f.ts.find_type("System.String").unwrap();
        let list_def = f.ts.find_type("System.Collections.Generic.List`1").unwrap();
        let list_string = f.ts.make_generic(&list_def, &[string.clone()]).unwrap();
        let panel = f
            .ts
            .define_type("TestApp", "TestApp.Controls", "Panel", TypeKind::Class, Some(&object));
        let property = f.ts.add_auto_property(&panel, "Items", &list_string, true, true);

        let resolved = resolve_regular_property(&property, &panel);
        assert_eq!(resolved.setters.len(), 2);
        assert!(matches!(resolved.setters[0].kind, SetterKind::Instance(_)));
        assert!(matches!(resolved.setters[1].kind, SetterKind::Adder { .. }));
        assert!(resolved.setters[1].allow_multiple);
    }
}
