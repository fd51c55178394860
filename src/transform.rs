//! Transformation pipeline core.
//!
//! The pipeline is an ordered batch of independent local rewrite rules,
//! each applied tree-wide (one full visitor pass) before the next rule
//! runs. The order is load-bearing: later passes assume invariants
//! established by earlier ones.
//!
//! ## Pass order
//!
//! 1.  Known-directives extraction
//! 2.  Constructor-arguments extraction
//! 3.  Intrinsics resolution (`Null`, `Type`)
//! 4.  Type-reference resolution
//! 5.  Property-reference resolution
//! 6.  Content-property resolution
//! 7.  Key extraction & property-value-to-assignment conversion
//! 8.  New-object / content transformer
//! 9.  Markup-extension transformation
//! 10. Value-type / string construction
//! 11. Deferred-content wrapping
//! 12. Top-down initialization reordering
//! 13. Flattening
//!
//! Structural errors are immediate hard errors carrying the offending
//! node's location. "Not found" conditions are recoverable only in
//! non-strict mode, where the unresolved node is left in place.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ast::{
    Document, DirectiveNode, Node, NullNode, SourceLocation, TextNode, TypeLiteralNode,
    XmlTypeReference,
};
use crate::content::{ContentPropertyTransformer, NewObjectTransformer, PropertyAssignmentTransformer};
use crate::diagnostics::{
    CompilerError, ERR_NAMESPACE_UNRESOLVED, ERR_PARSE_DIRECTIVE,
};
use crate::extensions::MarkupExtensionTransformer;
use crate::lowering::{
    DeferredContentTransformer, FlattenGroupsTransformer, TopDownInitializationTransformer,
    ValueTypeConstructionTransformer,
};
use crate::resolver::{PropertyReferenceResolver, TypeReferenceResolver};
use crate::types::{TypeSystem, WellKnownTypes, XamlType};
use crate::visitor::{rewrite_tree, AncestorInfo, NodeRewriter};

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Default URI of the markup (directive) namespace.
pub const MARKUP_NAMESPACE: &str = "http://schemas.microsoft.com/winfx/2006/xaml";

pub const DIRECTIVE_KEY: &str = "Key";
pub const DIRECTIVE_NAME: &str = "Name";
pub const DIRECTIVE_ARGUMENTS: &str = "Arguments";
pub const DIRECTIVE_TYPE_ARGUMENTS: &str = "TypeArguments";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Strict mode: unresolved references are immediate hard errors.
    pub strict: bool,
    /// Run the stack-balance verifier around every emitted node.
    pub verify_stack_balance: bool,
    /// Tolerate unknown XML entities instead of rejecting them. Replaces
    /// the legacy parser's process-wide toggle.
    pub legacy_entity_expansion: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            strict: true,
            verify_stack_balance: false,
            legacy_entity_expansion: false,
        }
    }
}

/// Maps one XML namespace URI onto CLR namespace/assembly candidates.
#[derive(Debug, Clone)]
pub struct ClrNamespaceBinding {
    pub clr_namespace: String,
    pub assembly: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// URIs treated as the markup (directive/intrinsic) namespace.
    pub markup_namespaces: Vec<String>,
    /// XML namespace URI → CLR namespace candidates, consulted in order.
    pub namespace_map: HashMap<String, Vec<ClrNamespaceBinding>>,
    /// Full name of the content-property marker attribute.
    pub content_attribute: String,
    /// Full name of the deferred-content marker attribute.
    pub deferred_content_attribute: String,
    /// Full name of the usable-during-initialization marker attribute.
    pub usable_during_init_attribute: String,
    pub options: CompileOptions,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig {
            markup_namespaces: vec![MARKUP_NAMESPACE.to_string()],
            namespace_map: HashMap::new(),
            content_attribute: "System.Windows.Markup.ContentPropertyAttribute".to_string(),
            deferred_content_attribute: "System.Windows.Markup.DeferredContentAttribute"
                .to_string(),
            usable_during_init_attribute:
                "System.Windows.Markup.UsableDuringInitializationAttribute".to_string(),
            options: CompileOptions::default(),
        }
    }

    pub fn map_namespace(&mut self, xml_namespace: &str, clr_namespace: &str, assembly: Option<&str>) {
        self.namespace_map
            .entry(xml_namespace.to_string())
            .or_default()
            .push(ClrNamespaceBinding {
                clr_namespace: clr_namespace.to_string(),
                assembly: assembly.map(|a| a.to_string()),
            });
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFORM CONTEXT
// ═══════════════════════════════════════════════════════════════════════════════

pub struct TransformContext<'a> {
    pub config: &'a CompilerConfig,
    pub type_system: &'a dyn TypeSystem,
    pub well_known: &'a WellKnownTypes,
    /// Namespace prefix → URI table from the document root.
    pub namespace_aliases: &'a HashMap<String, String>,
    pub file: String,
    local_counter: u32,
}

impl<'a> TransformContext<'a> {
    pub fn new(
        config: &'a CompilerConfig,
        type_system: &'a dyn TypeSystem,
        well_known: &'a WellKnownTypes,
        namespace_aliases: &'a HashMap<String, String>,
        file: &str,
    ) -> Self {
        TransformContext {
            config,
            type_system,
            well_known,
            namespace_aliases,
            file: file.to_string(),
            local_counter: 0,
        }
    }

    pub fn strict(&self) -> bool {
        self.config.options.strict
    }

    pub fn is_markup_namespace(&self, uri: &str) -> bool {
        self.config.markup_namespaces.iter().any(|ns| ns == uri)
    }

    pub fn error(&self, code: &str, message: &str, location: SourceLocation) -> CompilerError {
        CompilerError::new(code, message, &self.file, location.line, location.column)
    }

    pub fn next_local_id(&mut self) -> u32 {
        let id = self.local_counter;
        self.local_counter += 1;
        id
    }

    /// Resolve a `prefix:Name` (or bare `Name`) spelling against the
    /// document's alias table into an unresolved type reference.
    pub fn type_reference_from_alias(
        &self,
        spelling: &str,
        location: SourceLocation,
    ) -> Result<XmlTypeReference, CompilerError> {
        let (prefix, name) = match spelling.split_once(':') {
            Some((p, n)) => (p, n),
            None => ("", spelling),
        };
        let uri = self.namespace_aliases.get(prefix).ok_or_else(|| {
            self.error(
                ERR_NAMESPACE_UNRESOLVED,
                &format!("undeclared namespace alias '{}'", prefix),
                location,
            )
        })?;
        Ok(XmlTypeReference {
            xml_namespace: uri.clone(),
            name: name.to_string(),
            generic_arguments: Vec::new(),
            prefer_extension: false,
            location,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFORMER TRAIT & PIPELINE DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

pub trait AstTransformer {
    fn name(&self) -> &'static str;
    fn transform(
        &self,
        ctx: &mut TransformContext<'_>,
        ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError>;
}

struct PassAdapter<'p, 'c, 'a> {
    pass: &'p dyn AstTransformer,
    ctx: &'c mut TransformContext<'a>,
}

impl NodeRewriter for PassAdapter<'_, '_, '_> {
    fn rewrite(&mut self, ancestors: &[AncestorInfo], node: Node) -> Result<Node, CompilerError> {
        self.pass.transform(self.ctx, ancestors, node)
    }
}

pub fn default_pipeline() -> Vec<Box<dyn AstTransformer>> {
    vec![
        Box::new(KnownDirectivesTransformer),
        Box::new(ConstructorArgumentsTransformer),
        Box::new(IntrinsicsTransformer),
        Box::new(TypeReferenceResolver),
        Box::new(PropertyReferenceResolver),
        Box::new(ContentPropertyTransformer),
        Box::new(PropertyAssignmentTransformer),
        Box::new(NewObjectTransformer),
        Box::new(MarkupExtensionTransformer),
        Box::new(ValueTypeConstructionTransformer),
        Box::new(DeferredContentTransformer),
        Box::new(TopDownInitializationTransformer),
        Box::new(FlattenGroupsTransformer),
    ]
}

/// Run the full pipeline over a document, replacing the root subtree pass
/// by pass.
pub fn run_pipeline(
    document: &mut Document,
    ctx: &mut TransformContext<'_>,
) -> Result<(), CompilerError> {
    run_passes(document, ctx, &default_pipeline())
}

pub fn run_passes(
    document: &mut Document,
    ctx: &mut TransformContext<'_>,
    passes: &[Box<dyn AstTransformer>],
) -> Result<(), CompilerError> {
    for pass in passes {
        tracing::debug!(pass = pass.name(), "running transform pass");
        let root = std::mem::replace(
            &mut document.root,
            Node::Placeholder(crate::ast::PlaceholderNode {
                description: "root in flight".to_string(),
                location: SourceLocation::default(),
            }),
        );
        let mut adapter = PassAdapter { pass: pass.as_ref(), ctx };
        document.root = rewrite_tree(root, &mut adapter)?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// VALUE CONVERSION (shared by setter selection and struct construction)
// ═══════════════════════════════════════════════════════════════════════════════

/// Try to convert a value node to the target type. Returns the converted
/// node, or `None` if no registered conversion applies. Direct
/// assignability counts as the trivial conversion.
pub fn try_convert_value(node: &Node, target: &XamlType, wk: &WellKnownTypes) -> Option<Node> {
    if let Some(ty) = node.value_type_or(&wk.string) {
        if target.is_assignable_from(&ty) {
            return Some(node.clone());
        }
        // A type that can provide its own final value converts by whatever
        // ProvideValue returns; the emitter inserts the call and any cast.
        if let Some(provide) = ty
            .find_method("ProvideValue", 1)
            .or_else(|| ty.find_method("ProvideValue", 0))
        {
            let provided = provide.return_type();
            if target.is_assignable_from(&provided) || provided.is_assignable_from(target) {
                return Some(node.clone());
            }
        }
    }
    if let Node::Text(t) = node {
        let is_plain_string = t
            .ty
            .as_ref()
            .map(|ty| ty == &wk.string)
            .unwrap_or(true);
        if is_plain_string {
            // Nullable targets convert through their inner type; the
            // emitter inserts the wrap.
            let effective = target.nullable_inner().unwrap_or_else(|| target.clone());
            return convert_text(t, &effective, wk);
        }
    }
    None
}

fn convert_text(t: &TextNode, target: &XamlType, wk: &WellKnownTypes) -> Option<Node> {
    let typed = |ty: &XamlType| {
        Some(Node::Text(TextNode {
            text: t.text.clone(),
            ty: Some(ty.clone()),
            location: t.location,
        }))
    };
    if target == &wk.int32 {
        t.text.trim().parse::<i32>().ok()?;
        return typed(&wk.int32);
    }
    if target == &wk.double {
        t.text.trim().parse::<f64>().ok()?;
        return typed(&wk.double);
    }
    if target == &wk.boolean {
        let lowered = t.text.trim().to_ascii_lowercase();
        if lowered == "true" || lowered == "false" {
            return typed(&wk.boolean);
        }
        return None;
    }
    if target == &wk.string {
        return typed(&wk.string);
    }
    None
}

/// A strengthening conversion turns untyped text into a non-string value.
/// These outrank the trivial text-to-string direct match during setter
/// selection, so `Foo(int)` wins over `Foo(string)` for the text "42".
pub fn is_strengthening_conversion(node: &Node, target: &XamlType, wk: &WellKnownTypes) -> bool {
    if !matches!(node, Node::Text(t) if t.ty.is_none() || t.ty.as_ref() == Some(&wk.string)) {
        return false;
    }
    let effective = target.nullable_inner().unwrap_or_else(|| target.clone());
    if effective == wk.string {
        return false;
    }
    try_convert_value(node, target, wk).is_some()
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 1: KNOWN DIRECTIVES
// ═══════════════════════════════════════════════════════════════════════════════

/// Converts markup-namespace child elements (`Key`, `Name`, `Arguments`,
/// `TypeArguments` spelled as elements) into directive nodes, detaching
/// them from the ordinary children list.
pub struct KnownDirectivesTransformer;

const KNOWN_DIRECTIVES: &[&str] = &[
    DIRECTIVE_KEY,
    DIRECTIVE_NAME,
    DIRECTIVE_ARGUMENTS,
    DIRECTIVE_TYPE_ARGUMENTS,
];

impl AstTransformer for KnownDirectivesTransformer {
    fn name(&self) -> &'static str {
        "known-directives"
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
        for child in obj.children.iter_mut() {
            let Node::Object(inner) = child else { continue };
            let Node::XmlType(type_ref) = inner.type_reference.as_ref() else {
                continue;
            };
            if !ctx.is_markup_namespace(&type_ref.xml_namespace)
                || !KNOWN_DIRECTIVES.contains(&type_ref.name.as_str())
            {
                continue;
            }
            if ctx.strict() {
                if let Some(bad) = inner.children.iter().find(|c| !c.is_value()) {
                    return Err(ctx.error(
                        ERR_PARSE_DIRECTIVE,
                        &format!(
                            "directive '{}' may only contain values, found {}",
                            type_ref.name,
                            bad.describe()
                        ),
                        bad.location(),
                    ));
                }
            }
            let directive = DirectiveNode {
                namespace: type_ref.xml_namespace.clone(),
                name: type_ref.name.clone(),
                values: std::mem::take(&mut inner.children),
                location: inner.location,
            };
            *child = Node::Directive(directive);
        }
        Ok(Node::Object(obj))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 2: CONSTRUCTOR ARGUMENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Pulls an `Arguments` directive's children out as the explicit
/// constructor-argument list of the enclosing object node.
pub struct ConstructorArgumentsTransformer;

impl AstTransformer for ConstructorArgumentsTransformer {
    fn name(&self) -> &'static str {
        "constructor-arguments"
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
        let mut found: Option<DirectiveNode> = None;
        obj.children.retain_mut(|child| {
            let is_arguments = matches!(
                child,
                Node::Directive(d)
                    if d.name == DIRECTIVE_ARGUMENTS && ctx.is_markup_namespace(&d.namespace)
            );
            if is_arguments {
                if let Node::Directive(d) = std::mem::replace(
                    child,
                    Node::Placeholder(crate::ast::PlaceholderNode {
                        description: "consumed arguments directive".to_string(),
                        location: SourceLocation::default(),
                    }),
                ) {
                    // Keep the first; a duplicate is reported below.
                    if found.is_none() {
                        found = Some(d);
                    } else {
                        found = Some(DirectiveNode {
                            namespace: String::new(),
                            name: "<duplicate>".to_string(),
                            values: Vec::new(),
                            location: d.location,
                        });
                    }
                }
                false
            } else {
                true
            }
        });
        if let Some(directive) = found {
            if directive.name == "<duplicate>" {
                return Err(ctx.error(
                    ERR_PARSE_DIRECTIVE,
                    "more than one Arguments directive on a single element",
                    directive.location,
                ));
            }
            if !obj.arguments.is_empty() {
                return Err(ctx.error(
                    ERR_PARSE_DIRECTIVE,
                    "Arguments directive combined with inline constructor arguments",
                    directive.location,
                ));
            }
            obj.arguments = directive.values;
        }
        Ok(Node::Object(obj))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 3: INTRINSICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Recognizes `Null` and `Type` in the markup namespace and converts them
/// to dedicated nodes. `Type` requires exactly one text argument that
/// resolves through the alias table.
pub struct IntrinsicsTransformer;

impl AstTransformer for IntrinsicsTransformer {
    fn name(&self) -> &'static str {
        "intrinsics"
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
        let Node::XmlType(type_ref) = obj.type_reference.as_ref() else {
            return Ok(Node::Object(obj));
        };
        if !ctx.is_markup_namespace(&type_ref.xml_namespace) {
            return Ok(Node::Object(obj));
        }
        let intrinsic = type_ref.name.clone();
        match intrinsic.as_str() {
            "Null" => {
                if !obj.arguments.is_empty() || !obj.children.is_empty() {
                    return Err(ctx.error(
                        ERR_PARSE_DIRECTIVE,
                        "Null intrinsic takes no arguments",
                        obj.location,
                    ));
                }
                Ok(Node::Null(NullNode {
                    ty: ctx.well_known.null.clone(),
                    location: obj.location,
                }))
            }
            "Type" => {
                let mut values: Vec<&Node> =
                    obj.arguments.iter().chain(obj.children.iter()).collect();
                let single = match (values.len(), values.pop()) {
                    (1, Some(Node::Text(t))) => t,
                    _ => {
                        return Err(ctx.error(
                            ERR_PARSE_DIRECTIVE,
                            "Type intrinsic requires exactly one text argument",
                            obj.location,
                        ))
                    }
                };
                let reference =
                    ctx.type_reference_from_alias(single.text.trim(), single.location)?;
                Ok(Node::TypeLiteral(TypeLiteralNode {
                    type_reference: Box::new(Node::XmlType(reference)),
                    literal_type: ctx.well_known.system_type.clone(),
                    location: obj.location,
                }))
            }
            _ => Ok(Node::Object(obj)),
        }
    }
}
