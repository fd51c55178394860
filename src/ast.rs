//! AST node model for the markup compiler.
//!
//! The tree starts loosely typed (XML names, unresolved references) and is
//! progressively rewritten by the transformation pipeline into a resolved
//! imperative plan (object construction + property assignment + manipulation
//! nodes).
//!
//! ## Key Invariants
//!
//! 1. Every node carries a `SourceLocation` for diagnostics.
//! 2. Node kinds fall into four capability categories (not mutually
//!    exclusive): value, manipulation, type-reference, property-reference.
//! 3. After the full pipeline runs, no unresolved type-reference or
//!    property-reference node remains reachable from the root.
//! 4. Rewriting is by-value replacement: a child slot is reassigned with
//!    whatever the visitor returns, never mutated through shared aliases.

use serde::{Deserialize, Serialize};

use crate::types::{PropertySetter, ResolvedProperty, XamlConstructor, XamlMethod, XamlType};

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE LOCATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLocation { line, column }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NODE KINDS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum Node {
    /// Unresolved type reference: XML namespace URI + local name.
    XmlType(XmlTypeReference),
    /// Resolved type reference backed by a metadata handle.
    ClrType(ClrTypeReference),
    /// Unresolved property reference: declaring-type ref + name + target-type ref.
    NameProperty(NamePropertyReference),
    /// Resolved property reference with its setter candidates.
    ClrProperty(ClrPropertyReference),
    /// An element before constructor resolution: type ref, explicit
    /// constructor arguments, and raw children.
    Object(ObjectNode),
    /// A fully resolved construction expression.
    NewObject(NewObjectNode),
    /// Literal text. `ty` is `None` until a converter assigns a concrete
    /// type; untyped text is the string type.
    Text(TextNode),
    /// The `Null` intrinsic: a value of the null pseudo-type.
    Null(NullNode),
    /// The `Type` intrinsic: loads a runtime type object.
    TypeLiteral(TypeLiteralNode),
    /// A markup-language directive (`Key`, `Name`, `Arguments`, ...).
    Directive(DirectiveNode),
    /// One `<Owner.Property>` block or attribute before assignment
    /// conversion: a property reference plus its value list.
    PropertyValue(PropertyValueNode),
    /// A resolved single assignment: chosen setter candidates plus the
    /// argument list `[key?, value]`.
    Assignment(AssignmentNode),
    /// A no-return method call against the value currently on the stack.
    MethodCall(MethodCallNode),
    /// A sequence of manipulations applied to one target value.
    ManipulationGroup(ManipulationGroupNode),
    /// A value paired with the manipulations that populate it.
    ValueWithManipulations(ValueWithManipulationsNode),
    /// Marks the manipulation subtree that initializes one object; the
    /// x:Key search descends through this wrapper.
    ObjectInitialization(ObjectInitializationNode),
    /// A value produced by invoking `ProvideValue` on an extension object.
    MarkupExtension(MarkupExtensionNode),
    /// A value whose construction is wrapped in a lazily-invoked factory.
    DeferredContent(DeferredContentNode),
    /// Binds a constructed value to a compiler-generated local and yields it.
    LocalValue(LocalValueNode),
    /// Runs a manipulation against a previously bound compiler local.
    LocalManipulation(LocalManipulationNode),
    /// Inert placeholder left where a node had to be abandoned; the
    /// visitor never rewrites it or descends into it.
    Placeholder(PlaceholderNode),
}

#[derive(Debug, Clone)]
pub struct XmlTypeReference {
    pub xml_namespace: String,
    pub name: String,
    pub generic_arguments: Vec<Node>,
    /// Set for type names that appeared in markup-extension syntax;
    /// flips the Extension-suffix probe order during resolution.
    pub prefer_extension: bool,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct ClrTypeReference {
    pub ty: XamlType,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct NamePropertyReference {
    pub declaring_type: Box<Node>,
    pub name: String,
    pub target_type: Box<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct ClrPropertyReference {
    pub property: ResolvedProperty,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct ObjectNode {
    pub type_reference: Box<Node>,
    pub arguments: Vec<Node>,
    pub children: Vec<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct NewObjectNode {
    pub ty: XamlType,
    pub constructor: XamlConstructor,
    pub arguments: Vec<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct TextNode {
    pub text: String,
    pub ty: Option<XamlType>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct NullNode {
    pub ty: XamlType,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct TypeLiteralNode {
    pub type_reference: Box<Node>,
    /// The metadata type for `System.Type` itself, filled in when the
    /// intrinsic is recognized.
    pub literal_type: XamlType,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct DirectiveNode {
    pub namespace: String,
    pub name: String,
    pub values: Vec<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct PropertyValueNode {
    pub property: Box<Node>,
    pub values: Vec<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct AssignmentNode {
    pub property: ResolvedProperty,
    /// Surviving setter candidates, in declaration order. More than one
    /// entry means the choice is deferred to emission.
    pub setters: Vec<PropertySetter>,
    /// `[key?, value]` — the value is always the final argument.
    pub arguments: Vec<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct MethodCallNode {
    pub method: XamlMethod,
    pub arguments: Vec<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct ManipulationGroupNode {
    pub children: Vec<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct ValueWithManipulationsNode {
    pub value: Box<Node>,
    pub manipulation: Box<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct ObjectInitializationNode {
    pub ty: XamlType,
    pub manipulation: Box<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct MarkupExtensionNode {
    pub value: Box<Node>,
    pub provide_value: XamlMethod,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct DeferredContentNode {
    pub value: Box<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct LocalValueNode {
    pub local_id: u32,
    pub value: Box<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct LocalManipulationNode {
    pub local_id: u32,
    pub manipulation: Box<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct PlaceholderNode {
    pub description: String,
    pub location: SourceLocation,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOCUMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Top-level parse result: the root node plus the namespace alias table
/// declared on the root element. Immutable after parse, except that the
/// pipeline may replace the root subtree.
#[derive(Debug)]
pub struct Document {
    pub root: Node,
    pub namespace_aliases: std::collections::HashMap<String, String>,
    pub file: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPABILITY QUERIES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    XmlType,
    ClrType,
    NameProperty,
    ClrProperty,
    Object,
    NewObject,
    Text,
    Null,
    TypeLiteral,
    Directive,
    PropertyValue,
    Assignment,
    MethodCall,
    ManipulationGroup,
    ValueWithManipulations,
    ObjectInitialization,
    MarkupExtension,
    DeferredContent,
    LocalValue,
    LocalManipulation,
    Placeholder,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::XmlType(_) => NodeKind::XmlType,
            Node::ClrType(_) => NodeKind::ClrType,
            Node::NameProperty(_) => NodeKind::NameProperty,
            Node::ClrProperty(_) => NodeKind::ClrProperty,
            Node::Object(_) => NodeKind::Object,
            Node::NewObject(_) => NodeKind::NewObject,
            Node::Text(_) => NodeKind::Text,
            Node::Null(_) => NodeKind::Null,
            Node::TypeLiteral(_) => NodeKind::TypeLiteral,
            Node::Directive(_) => NodeKind::Directive,
            Node::PropertyValue(_) => NodeKind::PropertyValue,
            Node::Assignment(_) => NodeKind::Assignment,
            Node::MethodCall(_) => NodeKind::MethodCall,
            Node::ManipulationGroup(_) => NodeKind::ManipulationGroup,
            Node::ValueWithManipulations(_) => NodeKind::ValueWithManipulations,
            Node::ObjectInitialization(_) => NodeKind::ObjectInitialization,
            Node::MarkupExtension(_) => NodeKind::MarkupExtension,
            Node::DeferredContent(_) => NodeKind::DeferredContent,
            Node::LocalValue(_) => NodeKind::LocalValue,
            Node::LocalManipulation(_) => NodeKind::LocalManipulation,
            Node::Placeholder(_) => NodeKind::Placeholder,
        }
    }

    pub fn location(&self) -> SourceLocation {
        match self {
            Node::XmlType(n) => n.location,
            Node::ClrType(n) => n.location,
            Node::NameProperty(n) => n.location,
            Node::ClrProperty(n) => n.location,
            Node::Object(n) => n.location,
            Node::NewObject(n) => n.location,
            Node::Text(n) => n.location,
            Node::Null(n) => n.location,
            Node::TypeLiteral(n) => n.location,
            Node::Directive(n) => n.location,
            Node::PropertyValue(n) => n.location,
            Node::Assignment(n) => n.location,
            Node::MethodCall(n) => n.location,
            Node::ManipulationGroup(n) => n.location,
            Node::ValueWithManipulations(n) => n.location,
            Node::ObjectInitialization(n) => n.location,
            Node::MarkupExtension(n) => n.location,
            Node::DeferredContent(n) => n.location,
            Node::LocalValue(n) => n.location,
            Node::LocalManipulation(n) => n.location,
            Node::Placeholder(n) => n.location,
        }
    }

    /// Does this node produce a typed value when emitted?
    pub fn is_value(&self) -> bool {
        matches!(
            self,
            Node::Object(_)
                | Node::NewObject(_)
                | Node::Text(_)
                | Node::Null(_)
                | Node::TypeLiteral(_)
                | Node::ValueWithManipulations(_)
                | Node::MarkupExtension(_)
                | Node::DeferredContent(_)
                | Node::LocalValue(_)
        )
    }

    /// Does this node mutate an existing target, producing nothing?
    pub fn is_manipulation(&self) -> bool {
        matches!(
            self,
            Node::Assignment(_)
                | Node::MethodCall(_)
                | Node::ManipulationGroup(_)
                | Node::ObjectInitialization(_)
                | Node::LocalManipulation(_)
        )
    }

    pub fn is_type_reference(&self) -> bool {
        matches!(self, Node::XmlType(_) | Node::ClrType(_))
    }

    pub fn is_property_reference(&self) -> bool {
        matches!(self, Node::NameProperty(_) | Node::ClrProperty(_))
    }

    /// The statically known type of a value node, if it has one yet.
    /// String-typed text answers `None` until the caller substitutes the
    /// well-known string handle; see `value_type_or`.
    pub fn value_type(&self) -> Option<XamlType> {
        match self {
            Node::NewObject(n) => Some(n.ty.clone()),
            Node::Text(n) => n.ty.clone(),
            Node::Null(n) => Some(n.ty.clone()),
            Node::TypeLiteral(n) => Some(n.literal_type.clone()),
            Node::ValueWithManipulations(n) => n.value.value_type(),
            Node::MarkupExtension(n) => Some(n.provide_value.return_type()),
            Node::DeferredContent(n) => n.value.value_type(),
            Node::LocalValue(n) => n.value.value_type(),
            Node::Object(n) => match n.type_reference.as_ref() {
                Node::ClrType(t) => Some(t.ty.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Like `value_type`, but untyped text falls back to the given string
    /// type handle.
    pub fn value_type_or(&self, string_type: &XamlType) -> Option<XamlType> {
        match self {
            Node::Text(n) => Some(n.ty.clone().unwrap_or_else(|| string_type.clone())),
            Node::ValueWithManipulations(n) => n.value.value_type_or(string_type),
            Node::LocalValue(n) => n.value.value_type_or(string_type),
            Node::DeferredContent(n) => n.value.value_type_or(string_type),
            other => other.value_type(),
        }
    }

    /// Nodes the visitor must leave untouched entirely.
    pub fn skip_rewrite(&self) -> bool {
        matches!(self, Node::Placeholder(_))
    }

    /// Short description for internal-error reports.
    pub fn describe(&self) -> String {
        match self {
            Node::XmlType(n) => format!("xml type reference '{}'", n.name),
            Node::ClrType(n) => format!("type reference '{}'", n.ty.full_name()),
            Node::NameProperty(n) => format!("property reference '{}'", n.name),
            Node::ClrProperty(n) => format!("property '{}'", n.property.name()),
            Node::Object(_) => "object element".to_string(),
            Node::NewObject(n) => format!("construction of '{}'", n.ty.full_name()),
            Node::Text(n) => format!("text '{}'", n.text),
            Node::Null(_) => "null value".to_string(),
            Node::TypeLiteral(_) => "type literal".to_string(),
            Node::Directive(n) => format!("directive '{}'", n.name),
            Node::PropertyValue(_) => "property value".to_string(),
            Node::Assignment(n) => format!("assignment to '{}'", n.property.name()),
            Node::MethodCall(n) => format!("call to '{}'", n.method.name()),
            Node::ManipulationGroup(_) => "manipulation group".to_string(),
            Node::ValueWithManipulations(_) => "value with manipulations".to_string(),
            Node::ObjectInitialization(_) => "object initialization".to_string(),
            Node::MarkupExtension(_) => "markup extension".to_string(),
            Node::DeferredContent(_) => "deferred content".to_string(),
            Node::LocalValue(n) => format!("compiler local #{}", n.local_id),
            Node::LocalManipulation(n) => format!("manipulation of compiler local #{}", n.local_id),
            Node::Placeholder(n) => n.description.clone(),
        }
    }
}
