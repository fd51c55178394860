//! Type-system abstraction.
//!
//! The pipeline and the emission context depend only on the `TypeSystem`
//! capability trait and the handle types defined here, never on a concrete
//! metadata backend. Handle equality is identity-based: two handles for the
//! same underlying type or member from the same backend instance compare
//! equal, and handles are never mutated after the backend finishes
//! constructing them (the builder capability is the one sanctioned route
//! for adding members).
//!
//! Lookups return `Option` — absence is not an error at this layer; callers
//! decide whether a missing name is fatal (strict mode) or tolerated.
//!
//! The "all members including inherited" helpers at the bottom are a
//! convenience layer walking `base_type` and `interfaces`; they are not a
//! backend responsibility.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::diagnostics::{CompilerError, ERR_TYPE_UNRESOLVED};
use crate::il::Instruction;

// ═══════════════════════════════════════════════════════════════════════════════
// TYPE HANDLES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    ValueType,
    Interface,
    Enum,
    GenericParameter,
    Array,
    /// The null pseudo-type: assignable to any reference type and to
    /// `Nullable<T>`, never to a bare value type.
    PseudoNull,
}

pub(crate) struct TypeDef {
    pub assembly: String,
    pub namespace: String,
    pub name: String,
    pub kind: TypeKind,
    pub base: RefCell<Option<XamlType>>,
    pub interfaces: RefCell<Vec<XamlType>>,
    pub properties: RefCell<Vec<XamlProperty>>,
    pub fields: RefCell<Vec<XamlField>>,
    pub methods: RefCell<Vec<XamlMethod>>,
    pub constructors: RefCell<Vec<XamlConstructor>>,
    pub events: RefCell<Vec<XamlEvent>>,
    pub attributes: RefCell<Vec<CustomAttribute>>,
    pub generic_parameters: RefCell<Vec<XamlType>>,
    pub generic_definition: RefCell<Option<XamlType>>,
    pub generic_arguments: RefCell<Vec<XamlType>>,
    pub element_type: RefCell<Option<XamlType>>,
}

#[derive(Clone)]
pub struct XamlType(pub(crate) Rc<TypeDef>);

impl PartialEq for XamlType {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for XamlType {}
impl std::hash::Hash for XamlType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}
impl std::fmt::Debug for XamlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XamlType({})", self.full_name())
    }
}

impl XamlType {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn namespace(&self) -> &str {
        &self.0.namespace
    }

    pub fn assembly_name(&self) -> &str {
        &self.0.assembly
    }

    pub fn kind(&self) -> TypeKind {
        self.0.kind
    }

    pub fn full_name(&self) -> String {
        let base = if self.0.namespace.is_empty() {
            self.0.name.clone()
        } else {
            format!("{}.{}", self.0.namespace, self.0.name)
        };
        let args = self.0.generic_arguments.borrow();
        if args.is_empty() {
            base
        } else {
            let rendered: Vec<String> = args.iter().map(|a| a.full_name()).collect();
            format!("{}[{}]", base, rendered.join(","))
        }
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self.0.kind, TypeKind::ValueType | TypeKind::Enum)
    }

    pub fn is_interface(&self) -> bool {
        self.0.kind == TypeKind::Interface
    }

    pub fn is_null_pseudo(&self) -> bool {
        self.0.kind == TypeKind::PseudoNull
    }

    pub fn base_type(&self) -> Option<XamlType> {
        self.0.base.borrow().clone()
    }

    pub fn interfaces(&self) -> Vec<XamlType> {
        self.0.interfaces.borrow().clone()
    }

    pub fn properties(&self) -> Vec<XamlProperty> {
        self.0.properties.borrow().clone()
    }

    pub fn fields(&self) -> Vec<XamlField> {
        self.0.fields.borrow().clone()
    }

    pub fn methods(&self) -> Vec<XamlMethod> {
        self.0.methods.borrow().clone()
    }

    pub fn constructors(&self) -> Vec<XamlConstructor> {
        self.0.constructors.borrow().clone()
    }

    pub fn events(&self) -> Vec<XamlEvent> {
        self.0.events.borrow().clone()
    }

    pub fn attributes(&self) -> Vec<CustomAttribute> {
        self.0.attributes.borrow().clone()
    }

    pub fn generic_arguments(&self) -> Vec<XamlType> {
        self.0.generic_arguments.borrow().clone()
    }

    pub fn generic_parameters(&self) -> Vec<XamlType> {
        self.0.generic_parameters.borrow().clone()
    }

    pub fn generic_definition(&self) -> Option<XamlType> {
        self.0.generic_definition.borrow().clone()
    }

    pub fn element_type(&self) -> Option<XamlType> {
        self.0.element_type.borrow().clone()
    }

    pub fn find_attribute(&self, attribute_full_name: &str) -> Option<CustomAttribute> {
        self.0
            .attributes
            .borrow()
            .iter()
            .find(|a| a.type_full_name == attribute_full_name)
            .cloned()
    }

    /// `Some(T)` when this handle is an instantiation of `System.Nullable`1`.
    pub fn nullable_inner(&self) -> Option<XamlType> {
        let def = self.generic_definition()?;
        if def.namespace() == "System" && def.name() == "Nullable`1" {
            self.generic_arguments().into_iter().next()
        } else {
            None
        }
    }

    fn is_system_object(&self) -> bool {
        self.0.namespace == "System" && self.0.name == "Object"
    }

    /// Assignability between two handles. Three special cases on top of
    /// the base-chain/interface walk: the null pseudo-type goes to any
    /// reference type or to `Nullable<T>`; value types are never assignable
    /// from reference types; everything (interfaces included) goes to
    /// `System.Object` explicitly.
    pub fn is_assignable_from(&self, other: &XamlType) -> bool {
        if self == other {
            return true;
        }
        if other.is_null_pseudo() {
            return !self.is_value_type() || self.nullable_inner().is_some();
        }
        if self.is_null_pseudo() {
            return false;
        }
        if let Some(inner) = self.nullable_inner() {
            if &inner == other {
                return true;
            }
        }
        if self.is_system_object() {
            return true;
        }
        if self.is_value_type() || other.is_value_type() {
            // No implicit boxing/unboxing at the assignability level.
            return false;
        }
        let mut cursor = other.base_type();
        while let Some(base) = cursor {
            if &base == self {
                return true;
            }
            cursor = base.base_type();
        }
        if self.is_interface() {
            return all_interfaces(other).iter().any(|i| i == self);
        }
        false
    }

    pub fn find_method(&self, name: &str, parameter_count: usize) -> Option<XamlMethod> {
        all_methods(self)
            .into_iter()
            .find(|m| m.name() == name && m.parameters().len() == parameter_count)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMBER HANDLES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct CustomAttribute {
    pub type_full_name: String,
    pub arguments: Vec<String>,
}

pub(crate) struct MethodDef {
    pub name: String,
    pub is_static: bool,
    pub is_public: bool,
    pub return_type: XamlType,
    pub parameters: Vec<XamlType>,
    pub declaring: RefCell<Weak<TypeDef>>,
    pub body: RefCell<Option<Vec<Instruction>>>,
}

#[derive(Clone)]
pub struct XamlMethod(pub(crate) Rc<MethodDef>);

impl PartialEq for XamlMethod {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for XamlMethod {}
impl std::fmt::Debug for XamlMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XamlMethod({})", self.0.name)
    }
}

impl XamlMethod {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_static(&self) -> bool {
        self.0.is_static
    }

    pub fn is_public(&self) -> bool {
        self.0.is_public
    }

    pub fn return_type(&self) -> XamlType {
        self.0.return_type.clone()
    }

    pub fn returns_void(&self) -> bool {
        let rt = &self.0.return_type;
        rt.namespace() == "System" && rt.name() == "Void"
    }

    pub fn parameters(&self) -> Vec<XamlType> {
        self.0.parameters.clone()
    }

    pub fn declaring_type(&self) -> Option<XamlType> {
        self.0.declaring.borrow().upgrade().map(XamlType)
    }

    pub fn body(&self) -> Option<Vec<Instruction>> {
        self.0.body.borrow().clone()
    }
}

pub(crate) struct CtorDef {
    pub is_public: bool,
    pub parameters: Vec<XamlType>,
    pub declaring: RefCell<Weak<TypeDef>>,
    pub body: RefCell<Option<Vec<Instruction>>>,
}

#[derive(Clone)]
pub struct XamlConstructor(pub(crate) Rc<CtorDef>);

impl PartialEq for XamlConstructor {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for XamlConstructor {}
impl std::fmt::Debug for XamlConstructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let declaring = self
            .declaring_type()
            .map(|t| t.full_name())
            .unwrap_or_default();
        write!(f, "XamlConstructor({}, {} args)", declaring, self.0.parameters.len())
    }
}

impl XamlConstructor {
    pub fn is_public(&self) -> bool {
        self.0.is_public
    }

    pub fn parameters(&self) -> Vec<XamlType> {
        self.0.parameters.clone()
    }

    pub fn declaring_type(&self) -> Option<XamlType> {
        self.0.declaring.borrow().upgrade().map(XamlType)
    }

    pub fn body(&self) -> Option<Vec<Instruction>> {
        self.0.body.borrow().clone()
    }
}

pub(crate) struct FieldDef {
    pub name: String,
    pub field_type: XamlType,
    pub is_static: bool,
    pub declaring: RefCell<Weak<TypeDef>>,
}

#[derive(Clone)]
pub struct XamlField(pub(crate) Rc<FieldDef>);

impl PartialEq for XamlField {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for XamlField {}
impl std::fmt::Debug for XamlField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XamlField({})", self.0.name)
    }
}

impl XamlField {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn field_type(&self) -> XamlType {
        self.0.field_type.clone()
    }

    pub fn is_static(&self) -> bool {
        self.0.is_static
    }
}

pub(crate) struct EventDef {
    pub name: String,
    pub add_method: XamlMethod,
}

#[derive(Clone)]
pub struct XamlEvent(pub(crate) Rc<EventDef>);

impl PartialEq for XamlEvent {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for XamlEvent {}
impl std::fmt::Debug for XamlEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XamlEvent({})", self.0.name)
    }
}

impl XamlEvent {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn add_method(&self) -> XamlMethod {
        self.0.add_method.clone()
    }
}

pub(crate) struct PropertyDef {
    pub name: String,
    pub property_type: XamlType,
    pub getter: Option<XamlMethod>,
    pub setter: Option<XamlMethod>,
    pub attributes: RefCell<Vec<CustomAttribute>>,
    pub declaring: RefCell<Weak<TypeDef>>,
}

#[derive(Clone)]
pub struct XamlProperty(pub(crate) Rc<PropertyDef>);

impl PartialEq for XamlProperty {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for XamlProperty {}
impl std::fmt::Debug for XamlProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XamlProperty({})", self.0.name)
    }
}

impl XamlProperty {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn property_type(&self) -> XamlType {
        self.0.property_type.clone()
    }

    pub fn getter(&self) -> Option<XamlMethod> {
        self.0.getter.clone()
    }

    pub fn setter(&self) -> Option<XamlMethod> {
        self.0.setter.clone()
    }

    pub fn declaring_type(&self) -> Option<XamlType> {
        self.0.declaring.borrow().upgrade().map(XamlType)
    }

    pub fn attributes(&self) -> Vec<CustomAttribute> {
        self.0.attributes.borrow().clone()
    }

    pub fn has_attribute(&self, full_name: &str) -> bool {
        self.0
            .attributes
            .borrow()
            .iter()
            .any(|a| a.type_full_name == full_name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SETTER DESCRIPTORS
// ═══════════════════════════════════════════════════════════════════════════════

/// One way to assign or append a value to a property. Multiple descriptors
/// may apply to a single logical property; the pipeline picks the right
/// ones per call site.
#[derive(Debug, Clone)]
pub struct PropertySetter {
    pub kind: SetterKind,
    /// Call-site parameter types, excluding the target: `[value]` or, for
    /// dictionary-style adders, `[key, value]`.
    pub parameters: Vec<XamlType>,
    pub allow_null: bool,
    pub allow_multiple: bool,
}

#[derive(Debug, Clone)]
pub enum SetterKind {
    /// Ordinary instance setter: `target.set_X(value)`.
    Instance(XamlMethod),
    /// Attached-property static setter: `Owner.SetX(target, value)`.
    AttachedStatic(XamlMethod),
    /// Collection adder: `target.get_X().Add(args...)`.
    Adder { getter: XamlMethod, add: XamlMethod },
    /// Event subscription: `target.add_X(handler)`.
    EventAdd(XamlMethod),
}

/// A fully resolved property reference as the pipeline sees it: the logical
/// identity plus every setter candidate discovered for it.
#[derive(Debug, Clone)]
pub struct ResolvedProperty {
    pub name: String,
    pub declaring_type: XamlType,
    /// The logical value type: property type, attached setter's value
    /// parameter, or event handler type.
    pub value_type: XamlType,
    pub getter: Option<XamlMethod>,
    pub setters: Vec<PropertySetter>,
    pub attributes: Vec<CustomAttribute>,
}

impl ResolvedProperty {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_attribute(&self, full_name: &str) -> bool {
        self.attributes.iter().any(|a| a.type_full_name == full_name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ASSEMBLY
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) struct AssemblyDef {
    pub name: String,
    pub types: RefCell<Vec<XamlType>>,
}

#[derive(Clone)]
pub struct XamlAssembly(pub(crate) Rc<AssemblyDef>);

impl std::fmt::Debug for XamlAssembly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XamlAssembly({})", self.0.name)
    }
}

impl XamlAssembly {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn types(&self) -> Vec<XamlType> {
        self.0.types.borrow().clone()
    }

    pub fn find_type(&self, full_name: &str) -> Option<XamlType> {
        self.0
            .types
            .borrow()
            .iter()
            .find(|t| t.full_name() == full_name)
            .cloned()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPABILITY TRAITS
// ═══════════════════════════════════════════════════════════════════════════════

pub trait TypeSystem {
    fn assemblies(&self) -> Vec<XamlAssembly>;
    fn find_assembly(&self, name: &str) -> Option<XamlAssembly>;
    /// Look up a type by fully-qualified name across all assemblies.
    fn find_type(&self, full_name: &str) -> Option<XamlType>;
    /// Look up a type within one named assembly.
    fn find_type_in(&self, assembly: &str, full_name: &str) -> Option<XamlType>;
    /// The distinguished null pseudo-type handle.
    fn null_type(&self) -> XamlType;
    /// Construct (and memoize) a generic instantiation.
    fn make_generic(&self, definition: &XamlType, arguments: &[XamlType]) -> Option<XamlType>;
    /// Construct (and memoize) an array type over `element`.
    fn make_array(&self, element: &XamlType) -> XamlType;
}

/// Builder capability: backends that can synthesize new types and members.
/// Runtime-context generation requires this.
pub trait TypeBuilder: TypeSystem {
    fn define_type(
        &self,
        assembly: &str,
        namespace: &str,
        name: &str,
        kind: TypeKind,
        base: Option<&XamlType>,
    ) -> XamlType;
    fn define_nested_type(
        &self,
        owner: &XamlType,
        name: &str,
        generic_parameter_names: &[&str],
        base: Option<&XamlType>,
    ) -> XamlType;
    fn define_field(
        &self,
        owner: &XamlType,
        name: &str,
        ty: &XamlType,
        is_static: bool,
    ) -> XamlField;
    fn define_method(
        &self,
        owner: &XamlType,
        name: &str,
        return_type: &XamlType,
        parameters: &[XamlType],
        is_static: bool,
    ) -> XamlMethod;
    fn define_constructor(&self, owner: &XamlType, parameters: &[XamlType]) -> XamlConstructor;
    fn define_property(
        &self,
        owner: &XamlType,
        name: &str,
        ty: &XamlType,
        getter: Option<&XamlMethod>,
        setter: Option<&XamlMethod>,
    ) -> XamlProperty;
    fn add_interface_implementation(&self, owner: &XamlType, iface: &XamlType);
    fn set_method_body(&self, method: &XamlMethod, body: Vec<Instruction>);
    fn set_constructor_body(&self, ctor: &XamlConstructor, body: Vec<Instruction>);
}

// ═══════════════════════════════════════════════════════════════════════════════
// DERIVED HELPERS (convenience layer, not abstraction responsibility)
// ═══════════════════════════════════════════════════════════════════════════════

pub fn all_properties(ty: &XamlType) -> Vec<XamlProperty> {
    let mut out = Vec::new();
    let mut cursor = Some(ty.clone());
    while let Some(t) = cursor {
        out.extend(t.properties());
        cursor = t.base_type();
    }
    out
}

pub fn all_fields(ty: &XamlType) -> Vec<XamlField> {
    let mut out = Vec::new();
    let mut cursor = Some(ty.clone());
    while let Some(t) = cursor {
        out.extend(t.fields());
        cursor = t.base_type();
    }
    out
}

pub fn all_methods(ty: &XamlType) -> Vec<XamlMethod> {
    let mut out = Vec::new();
    let mut cursor = Some(ty.clone());
    while let Some(t) = cursor {
        out.extend(t.methods());
        cursor = t.base_type();
    }
    out
}

pub fn all_events(ty: &XamlType) -> Vec<XamlEvent> {
    let mut out = Vec::new();
    let mut cursor = Some(ty.clone());
    while let Some(t) = cursor {
        out.extend(t.events());
        cursor = t.base_type();
    }
    out
}

pub fn all_interfaces(ty: &XamlType) -> Vec<XamlType> {
    fn collect(ty: &XamlType, out: &mut Vec<XamlType>) {
        for iface in ty.interfaces() {
            if !out.contains(&iface) {
                collect(&iface, out);
                out.push(iface);
            }
        }
        if let Some(base) = ty.base_type() {
            collect(&base, out);
        }
    }
    let mut out = Vec::new();
    collect(ty, &mut out);
    out
}

/// Walk the base-type chain looking for a marker attribute. Used for the
/// "usable during initialization" capability flag.
pub fn has_attribute_in_hierarchy(ty: &XamlType, attribute_full_name: &str) -> bool {
    let mut cursor = Some(ty.clone());
    while let Some(t) = cursor {
        if t.find_attribute(attribute_full_name).is_some() {
            return true;
        }
        cursor = t.base_type();
    }
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// WELL-KNOWN TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// The handful of types the conversion table and the emitters name
/// directly, resolved once per compilation.
#[derive(Debug, Clone)]
pub struct WellKnownTypes {
    pub object: XamlType,
    pub string: XamlType,
    pub void: XamlType,
    pub boolean: XamlType,
    pub int32: XamlType,
    pub double: XamlType,
    pub system_type: XamlType,
    pub nullable_definition: Option<XamlType>,
    pub service_provider: Option<XamlType>,
    pub null: XamlType,
}

impl WellKnownTypes {
    pub fn resolve(ts: &dyn TypeSystem) -> Result<WellKnownTypes, CompilerError> {
        let required = |name: &str| -> Result<XamlType, CompilerError> {
            ts.find_type(name).ok_or_else(|| {
                CompilerError::new(
                    ERR_TYPE_UNRESOLVED,
                    &format!("core type '{}' is missing from the metadata backend", name),
                    "",
                    0,
                    0,
                )
            })
        };
        Ok(WellKnownTypes {
            object: required("System.Object")?,
            string: required("System.String")?,
            void: required("System.Void")?,
            boolean: required("System.Boolean")?,
            int32: required("System.Int32")?,
            double: required("System.Double")?,
            system_type: required("System.Type")?,
            nullable_definition: ts.find_type("System.Nullable`1"),
            service_provider: ts.find_type("System.IServiceProvider"),
            null: ts.null_type(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY BACKEND
// ═══════════════════════════════════════════════════════════════════════════════

/// Static-metadata-style backend: every type and member is registered
/// through the builder capability and memoized for identity-stable handles.
/// This is the backend the test suite populates and the target the
/// runtime-context generator builds into.
pub struct InMemoryTypeSystem {
    assemblies: RefCell<Vec<XamlAssembly>>,
    generic_cache: RefCell<HashMap<String, XamlType>>,
    array_cache: RefCell<HashMap<usize, XamlType>>,
    null: XamlType,
}

fn new_type_def(assembly: &str, namespace: &str, name: &str, kind: TypeKind) -> Rc<TypeDef> {
    Rc::new(TypeDef {
        assembly: assembly.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        kind,
        base: RefCell::new(None),
        interfaces: RefCell::new(Vec::new()),
        properties: RefCell::new(Vec::new()),
        fields: RefCell::new(Vec::new()),
        methods: RefCell::new(Vec::new()),
        constructors: RefCell::new(Vec::new()),
        events: RefCell::new(Vec::new()),
        attributes: RefCell::new(Vec::new()),
        generic_parameters: RefCell::new(Vec::new()),
        generic_definition: RefCell::new(None),
        generic_arguments: RefCell::new(Vec::new()),
        element_type: RefCell::new(None),
    })
}

impl InMemoryTypeSystem {
    pub fn new() -> Self {
        InMemoryTypeSystem {
            assemblies: RefCell::new(Vec::new()),
            generic_cache: RefCell::new(HashMap::new()),
            array_cache: RefCell::new(HashMap::new()),
            null: XamlType(new_type_def("", "", "<null>", TypeKind::PseudoNull)),
        }
    }

    /// Backend pre-populated with the core `System` surface the compiler's
    /// conversion table and runtime-context generator rely on.
    pub fn with_core_types() -> Self {
        let ts = Self::new();
        let object = ts.define_type("System", "System", "Object", TypeKind::Class, None);
        let void = ts.define_type("System", "System", "Void", TypeKind::ValueType, None);
        let string = ts.define_type("System", "System", "String", TypeKind::Class, Some(&object));
        let boolean = ts.define_type("System", "System", "Boolean", TypeKind::ValueType, Some(&object));
        let int32 = ts.define_type("System", "System", "Int32", TypeKind::ValueType, Some(&object));
        ts.define_type("System", "System", "Double", TypeKind::ValueType, Some(&object));
        let sys_type = ts.define_type("System", "System", "Type", TypeKind::Class, Some(&object));
        ts.define_method(&sys_type, "IsInstanceOfType", &boolean, &[object.clone()], false);

        let sp = ts.define_type(
            "System",
            "System",
            "IServiceProvider",
            TypeKind::Interface,
            None,
        );
        ts.define_method(&sp, "GetService", &object, &[sys_type.clone()], false);

        let ioe = ts.define_type(
            "System",
            "System",
            "InvalidOperationException",
            TypeKind::Class,
            Some(&object),
        );
        ts.define_constructor(&ioe, &[string.clone()]);

        // Nullable<T>: wrap ctor plus the value accessor pair.
        let nullable = ts.define_type("System", "System", "Nullable`1", TypeKind::ValueType, None);
        let t_param = XamlType(new_type_def("", "", "T", TypeKind::GenericParameter));
        nullable.0.generic_parameters.borrow_mut().push(t_param.clone());
        ts.define_constructor(&nullable, &[t_param.clone()]);
        ts.define_method(&nullable, "get_Value", &t_param, &[], false);
        ts.define_method(&nullable, "get_HasValue", &boolean, &[], false);

        // List<T> and Dictionary<K,V>: the collection shapes the adder
        // machinery and the runtime context lean on.
        let list = ts.define_type(
            "System",
            "System.Collections.Generic",
            "List`1",
            TypeKind::Class,
            Some(&object),
        );
        let list_t = XamlType(new_type_def("", "", "T", TypeKind::GenericParameter));
        list.0.generic_parameters.borrow_mut().push(list_t.clone());
        ts.define_constructor(&list, &[]);
        ts.define_method(&list, "Add", &void, &[list_t.clone()], false);
        ts.define_method(&list, "get_Count", &int32, &[], false);
        ts.define_method(&list, "get_Item", &list_t, &[int32.clone()], false);
        ts.define_method(&list, "RemoveAt", &void, &[int32.clone()], false);

        let dict = ts.define_type(
            "System",
            "System.Collections.Generic",
            "Dictionary`2",
            TypeKind::Class,
            Some(&object),
        );
        let k = XamlType(new_type_def("", "", "TKey", TypeKind::GenericParameter));
        let v = XamlType(new_type_def("", "", "TValue", TypeKind::GenericParameter));
        dict.0.generic_parameters.borrow_mut().push(k.clone());
        dict.0.generic_parameters.borrow_mut().push(v.clone());
        ts.define_constructor(&dict, &[]);
        ts.define_method(&dict, "Add", &void, &[k, v], false);

        ts
    }

    fn assembly_entry(&self, name: &str) -> XamlAssembly {
        if let Some(existing) = self.find_assembly(name) {
            return existing;
        }
        let asm = XamlAssembly(Rc::new(AssemblyDef {
            name: name.to_string(),
            types: RefCell::new(Vec::new()),
        }));
        self.assemblies.borrow_mut().push(asm.clone());
        asm
    }

    fn substitute(ty: &XamlType, map: &[(XamlType, XamlType)]) -> XamlType {
        for (param, arg) in map {
            if ty == param {
                return arg.clone();
            }
        }
        ty.clone()
    }
}

impl Default for InMemoryTypeSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeSystem for InMemoryTypeSystem {
    fn assemblies(&self) -> Vec<XamlAssembly> {
        self.assemblies.borrow().clone()
    }

    fn find_assembly(&self, name: &str) -> Option<XamlAssembly> {
        self.assemblies
            .borrow()
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    fn find_type(&self, full_name: &str) -> Option<XamlType> {
        for asm in self.assemblies.borrow().iter() {
            if let Some(t) = asm.find_type(full_name) {
                return Some(t);
            }
        }
        None
    }

    fn find_type_in(&self, assembly: &str, full_name: &str) -> Option<XamlType> {
        self.find_assembly(assembly)?.find_type(full_name)
    }

    fn null_type(&self) -> XamlType {
        self.null.clone()
    }

    fn make_generic(&self, definition: &XamlType, arguments: &[XamlType]) -> Option<XamlType> {
        let params = definition.generic_parameters();
        if params.is_empty() || params.len() != arguments.len() {
            return None;
        }
        let key = format!(
            "{}[{}]",
            definition.full_name(),
            arguments
                .iter()
                .map(|a| format!("{:p}", Rc::as_ptr(&a.0)))
                .collect::<Vec<_>>()
                .join(",")
        );
        if let Some(cached) = self.generic_cache.borrow().get(&key) {
            return Some(cached.clone());
        }

        let def = new_type_def(
            definition.assembly_name(),
            definition.namespace(),
            definition.name(),
            definition.kind(),
        );
        let instance = XamlType(def.clone());
        *def.generic_definition.borrow_mut() = Some(definition.clone());
        *def.generic_arguments.borrow_mut() = arguments.to_vec();
        *def.base.borrow_mut() = definition.base_type();
        let map: Vec<(XamlType, XamlType)> = params
            .iter()
            .cloned()
            .zip(arguments.iter().cloned())
            .collect();

        for m in definition.methods() {
            let substituted = XamlMethod(Rc::new(MethodDef {
                name: m.name().to_string(),
                is_static: m.is_static(),
                is_public: m.is_public(),
                return_type: Self::substitute(&m.return_type(), &map),
                parameters: m
                    .parameters()
                    .iter()
                    .map(|p| Self::substitute(p, &map))
                    .collect(),
                declaring: RefCell::new(Rc::downgrade(&def)),
                body: RefCell::new(None),
            }));
            def.methods.borrow_mut().push(substituted);
        }
        for c in definition.constructors() {
            let substituted = XamlConstructor(Rc::new(CtorDef {
                is_public: c.is_public(),
                parameters: c
                    .parameters()
                    .iter()
                    .map(|p| Self::substitute(p, &map))
                    .collect(),
                declaring: RefCell::new(Rc::downgrade(&def)),
                body: RefCell::new(None),
            }));
            def.constructors.borrow_mut().push(substituted);
        }
        for p in definition.properties() {
            let substituted = XamlProperty(Rc::new(PropertyDef {
                name: p.name().to_string(),
                property_type: Self::substitute(&p.property_type(), &map),
                getter: p.getter(),
                setter: p.setter(),
                attributes: RefCell::new(p.attributes()),
                declaring: RefCell::new(Rc::downgrade(&def)),
            }));
            def.properties.borrow_mut().push(substituted);
        }

        self.generic_cache
            .borrow_mut()
            .insert(key, instance.clone());
        Some(instance)
    }

    fn make_array(&self, element: &XamlType) -> XamlType {
        let key = Rc::as_ptr(&element.0) as usize;
        if let Some(cached) = self.array_cache.borrow().get(&key) {
            return cached.clone();
        }
        let def = new_type_def(
            element.assembly_name(),
            element.namespace(),
            &format!("{}[]", element.name()),
            TypeKind::Array,
        );
        *def.element_type.borrow_mut() = Some(element.clone());
        let arr = XamlType(def);
        self.array_cache.borrow_mut().insert(key, arr.clone());
        arr
    }
}

impl TypeBuilder for InMemoryTypeSystem {
    fn define_type(
        &self,
        assembly: &str,
        namespace: &str,
        name: &str,
        kind: TypeKind,
        base: Option<&XamlType>,
    ) -> XamlType {
        let asm = self.assembly_entry(assembly);
        let def = new_type_def(assembly, namespace, name, kind);
        *def.base.borrow_mut() = base.cloned();
        let ty = XamlType(def);
        asm.0.types.borrow_mut().push(ty.clone());
        ty
    }

    fn define_nested_type(
        &self,
        owner: &XamlType,
        name: &str,
        generic_parameter_names: &[&str],
        base: Option<&XamlType>,
    ) -> XamlType {
        let nested_name = format!("{}+{}", owner.name(), name);
        let ty = self.define_type(
            owner.assembly_name(),
            owner.namespace(),
            &nested_name,
            TypeKind::Class,
            base,
        );
        for gp in generic_parameter_names {
            ty.0.generic_parameters
                .borrow_mut()
                .push(XamlType(new_type_def("", "", gp, TypeKind::GenericParameter)));
        }
        ty
    }

    fn define_field(
        &self,
        owner: &XamlType,
        name: &str,
        ty: &XamlType,
        is_static: bool,
    ) -> XamlField {
        let field = XamlField(Rc::new(FieldDef {
            name: name.to_string(),
            field_type: ty.clone(),
            is_static,
            declaring: RefCell::new(Rc::downgrade(&owner.0)),
        }));
        owner.0.fields.borrow_mut().push(field.clone());
        field
    }

    fn define_method(
        &self,
        owner: &XamlType,
        name: &str,
        return_type: &XamlType,
        parameters: &[XamlType],
        is_static: bool,
    ) -> XamlMethod {
        let method = XamlMethod(Rc::new(MethodDef {
            name: name.to_string(),
            is_static,
            is_public: true,
            return_type: return_type.clone(),
            parameters: parameters.to_vec(),
            declaring: RefCell::new(Rc::downgrade(&owner.0)),
            body: RefCell::new(None),
        }));
        owner.0.methods.borrow_mut().push(method.clone());
        method
    }

    fn define_constructor(&self, owner: &XamlType, parameters: &[XamlType]) -> XamlConstructor {
        let ctor = XamlConstructor(Rc::new(CtorDef {
            is_public: true,
            parameters: parameters.to_vec(),
            declaring: RefCell::new(Rc::downgrade(&owner.0)),
            body: RefCell::new(None),
        }));
        owner.0.constructors.borrow_mut().push(ctor.clone());
        ctor
    }

    fn define_property(
        &self,
        owner: &XamlType,
        name: &str,
        ty: &XamlType,
        getter: Option<&XamlMethod>,
        setter: Option<&XamlMethod>,
    ) -> XamlProperty {
        let property = XamlProperty(Rc::new(PropertyDef {
            name: name.to_string(),
            property_type: ty.clone(),
            getter: getter.cloned(),
            setter: setter.cloned(),
            attributes: RefCell::new(Vec::new()),
            declaring: RefCell::new(Rc::downgrade(&owner.0)),
        }));
        owner.0.properties.borrow_mut().push(property.clone());
        property
    }

    fn add_interface_implementation(&self, owner: &XamlType, iface: &XamlType) {
        owner.0.interfaces.borrow_mut().push(iface.clone());
    }

    fn set_method_body(&self, method: &XamlMethod, body: Vec<Instruction>) {
        *method.0.body.borrow_mut() = Some(body);
    }

    fn set_constructor_body(&self, ctor: &XamlConstructor, body: Vec<Instruction>) {
        *ctor.0.body.borrow_mut() = Some(body);
    }
}

// Convenience registration surface used by tests and fixtures. Auto-wires
// accessor methods the way metadata readers would expose them.
impl InMemoryTypeSystem {
    pub fn add_auto_property(
        &self,
        owner: &XamlType,
        name: &str,
        ty: &XamlType,
        readable: bool,
        writable: bool,
    ) -> XamlProperty {
        let getter = if readable {
            Some(self.define_method(owner, &format!("get_{}", name), ty, &[], false))
        } else {
            None
        };
        let void = self
            .find_type("System.Void")
            .unwrap_or_else(|| self.define_type("System", "System", "Void", TypeKind::ValueType, None));
        let setter = if writable {
            Some(self.define_method(
                owner,
                &format!("set_{}", name),
                &void,
                &[ty.clone()],
                false,
            ))
        } else {
            None
        };
        self.define_property(owner, name, ty, getter.as_ref(), setter.as_ref())
    }

    pub fn add_property_attribute(&self, property: &XamlProperty, full_name: &str) {
        property.0.attributes.borrow_mut().push(CustomAttribute {
            type_full_name: full_name.to_string(),
            arguments: Vec::new(),
        });
    }

    pub fn add_type_attribute(&self, ty: &XamlType, full_name: &str, arguments: Vec<String>) {
        ty.0.attributes.borrow_mut().push(CustomAttribute {
            type_full_name: full_name.to_string(),
            arguments,
        });
    }

    pub fn add_event(&self, owner: &XamlType, name: &str, handler_type: &XamlType) -> XamlEvent {
        let void = self
            .find_type("System.Void")
            .unwrap_or_else(|| self.define_type("System", "System", "Void", TypeKind::ValueType, None));
        let add = self.define_method(
            owner,
            &format!("add_{}", name),
            &void,
            &[handler_type.clone()],
            false,
        );
        let event = XamlEvent(Rc::new(EventDef {
            name: name.to_string(),
            add_method: add,
        }));
        owner.0.events.borrow_mut().push(event.clone());
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_stable_lookup() {
        let ts = InMemoryTypeSystem::with_core_types();
        let a = ts.find_type("System.String").unwrap();
        let b = ts.find_type("System.String").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, ts.find_type("System.Object").unwrap());
    }

    #[test]
    fn assignability_walks_base_chain_and_interfaces() {
        let ts = InMemoryTypeSystem::with_core_types();
        let object = ts.find_type("System.Object").unwrap();
        let base = ts.define_type("App", "App", "Animal", TypeKind::Class, Some(&object));
        let derived = ts.define_type("App", "App", "Dog", TypeKind::Class, Some(&base));
        let iface = ts.define_type("App", "App", "IPet", TypeKind::Interface, None);
        ts.add_interface_implementation(&derived, &iface);

        assert!(base.is_assignable_from(&derived));
        assert!(!derived.is_assignable_from(&base));
        assert!(iface.is_assignable_from(&derived));
        assert!(object.is_assignable_from(&derived));
        assert!(object.is_assignable_from(&iface));
    }

    #[test]
    fn null_pseudo_assignability() {
        let ts = InMemoryTypeSystem::with_core_types();
        let null = ts.null_type();
        let string = ts.find_type("System.String").unwrap();
        let int32 = ts.find_type("System.Int32").unwrap();
        let nullable_def = ts.find_type("System.Nullable`1").unwrap();
        let nullable_int = ts.make_generic(&nullable_def, &[int32.clone()]).unwrap();

        assert!(string.is_assignable_from(&null));
        assert!(!int32.is_assignable_from(&null));
        assert!(nullable_int.is_assignable_from(&null));
        // Wrap conversion is admitted at the relation level.
        assert!(nullable_int.is_assignable_from(&int32));
    }

    #[test]
    fn generic_instantiation_is_memoized_and_substituted() {
        let ts = InMemoryTypeSystem::with_core_types();
        let list_def = ts.find_type("System.Collections.Generic.List`1").unwrap();
        let string = ts.find_type("System.String").unwrap();
        let a = ts.make_generic(&list_def, &[string.clone()]).unwrap();
        let b = ts.make_generic(&list_def, &[string.clone()]).unwrap();
        assert_eq!(a, b);

        let add = a.find_method("Add", 1).unwrap();
        assert_eq!(add.parameters()[0], string);
        assert!(add.returns_void());
    }

    #[test]
    fn all_properties_includes_inherited() {
        let ts = InMemoryTypeSystem::with_core_types();
        let object = ts.find_type("System.Object").unwrap();
        let string = ts.find_type("System.String").unwrap();
        let base = ts.define_type("App", "App", "Control", TypeKind::Class, Some(&object));
        ts.add_auto_property(&base, "Name", &string, true, true);
        let derived = ts.define_type("App", "App", "Button", TypeKind::Class, Some(&base));
        ts.add_auto_property(&derived, "Text", &string, true, true);

        let names: Vec<String> = all_properties(&derived)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["Text".to_string(), "Name".to_string()]);
    }

    #[test]
    fn hierarchy_attribute_walk() {
        let ts = InMemoryTypeSystem::with_core_types();
        let object = ts.find_type("System.Object").unwrap();
        let base = ts.define_type("App", "App", "Panel", TypeKind::Class, Some(&object));
        ts.add_type_attribute(&base, "System.Windows.Markup.UsableDuringInitializationAttribute", vec![]);
        let derived = ts.define_type("App", "App", "Grid", TypeKind::Class, Some(&base));

        assert!(has_attribute_in_hierarchy(
            &derived,
            "System.Windows.Markup.UsableDuringInitializationAttribute"
        ));
        assert!(!has_attribute_in_hierarchy(
            &object,
            "System.Windows.Markup.UsableDuringInitializationAttribute"
        ));
    }
}
