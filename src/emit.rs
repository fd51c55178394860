//! Emission: resolved AST to abstract instructions.
//!
//! Conventions:
//! - A value node pushes exactly one value.
//! - A manipulation node consumes exactly one value (its target) and
//!   pushes nothing.
//! - A manipulation group duplicates the target before every child except
//!   the last; an empty group pops the target.
//!
//! Conversion decision table, applied when a value's static type differs
//! from the slot it flows into:
//! - Identity or widening reference conversion: no instruction.
//! - Narrowing reference conversion (or to/from an interface): `castclass`.
//! - Value type into `System.Object`: `box`. `System.Object` into a value
//!   type: `unbox.any`. No other reference type unboxes.
//! - `T` into `Nullable<T>`: wrap through the nullable constructor.
//!   `Nullable<T>` into `T`: unwrap through `get_Value`.
//! - Null into a reference type: `ldnull`. Null into `Nullable<T>`:
//!   zero-initialized local. Null into any other value type is an error.
//! - Anything else is a conversion error at the value's location.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{AssignmentNode, Node, SourceLocation};
use crate::checked_emit::CheckedEmitter;
use crate::diagnostics::{
    CompilerError, ERR_CONVERSION, ERR_PROPERTY_UNRESOLVED, ERR_TYPE_UNRESOLVED,
};
use crate::il::{CodeEmitter, Instruction, Local, RecordingEmitter};
use crate::transform::CompileOptions;
use crate::types::{
    PropertySetter, SetterKind, TypeBuilder, WellKnownTypes, XamlMethod, XamlType,
};

// ═══════════════════════════════════════════════════════════════════════════════
// LOCALS POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Reuses scratch locals by type. A rented local returns to the pool when
/// its handle drops; the context verifies nothing is still rented when
/// emission finishes.
#[derive(Clone, Default)]
pub struct LocalsPool {
    inner: Rc<RefCell<PoolInner>>,
}

#[derive(Default)]
struct PoolInner {
    free: HashMap<XamlType, Vec<Local>>,
    outstanding: usize,
}

pub struct PooledLocal {
    ty: XamlType,
    local: Local,
    pool: Rc<RefCell<PoolInner>>,
}

impl PooledLocal {
    pub fn local(&self) -> Local {
        self.local
    }
}

impl Drop for PooledLocal {
    fn drop(&mut self) {
        let mut inner = self.pool.borrow_mut();
        inner.free.entry(self.ty.clone()).or_default().push(self.local);
        inner.outstanding -= 1;
    }
}

impl LocalsPool {
    pub fn rent(&self, emitter: &mut dyn CodeEmitter, ty: &XamlType) -> PooledLocal {
        let mut inner = self.inner.borrow_mut();
        let local = inner
            .free
            .get_mut(ty)
            .and_then(|list| list.pop())
            .unwrap_or_else(|| emitter.define_local(ty));
        inner.outstanding += 1;
        PooledLocal {
            ty: ty.clone(),
            local,
            pool: Rc::clone(&self.inner),
        }
    }

    fn outstanding(&self) -> usize {
        self.inner.borrow().outstanding
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EMIT CONTEXT
// ═══════════════════════════════════════════════════════════════════════════════

/// Host for deferred-content factories: generated builder methods land on
/// `owner`.
#[derive(Clone, Copy)]
pub struct DeferredHost<'a> {
    pub builder: &'a dyn TypeBuilder,
    pub owner: &'a XamlType,
}

/// Runtime parent-stack wiring. When present, every value that is about to
/// be manipulated is pushed on the context's parent stack and popped when
/// its manipulations finish, so `ProvideValue` sees its lexical ancestors
/// at load time.
#[derive(Clone)]
pub struct ParentHooks {
    pub context_local: Local,
    pub push: XamlMethod,
    pub pop: XamlMethod,
}

pub struct EmitContext<'a> {
    well_known: &'a WellKnownTypes,
    options: &'a CompileOptions,
    file: String,
    pool: LocalsPool,
    /// Compiler-generated local bindings from the top-down pass.
    bound: HashMap<u32, Local>,
    service_provider: Option<Local>,
    deferred: Option<DeferredHost<'a>>,
    parent_hooks: Option<ParentHooks>,
}

impl<'a> EmitContext<'a> {
    pub fn new(well_known: &'a WellKnownTypes, options: &'a CompileOptions, file: &str) -> Self {
        EmitContext {
            well_known,
            options,
            file: file.to_string(),
            pool: LocalsPool::default(),
            bound: HashMap::new(),
            service_provider: None,
            deferred: None,
            parent_hooks: None,
        }
    }

    pub fn with_service_provider(mut self, local: Local) -> Self {
        self.service_provider = Some(local);
        self
    }

    /// Install the runtime-context wiring mid-body, once the context local
    /// actually holds a context instance.
    pub fn set_runtime_context(&mut self, local: Local, hooks: ParentHooks) {
        self.service_provider = Some(local);
        self.parent_hooks = Some(hooks);
    }

    pub fn with_deferred_host(mut self, host: DeferredHost<'a>) -> Self {
        self.deferred = Some(host);
        self
    }

    pub fn with_parent_hooks(mut self, hooks: ParentHooks) -> Self {
        self.parent_hooks = Some(hooks);
        self
    }

    fn error(&self, code: &str, message: &str, location: SourceLocation) -> CompilerError {
        CompilerError::new(code, message, &self.file, location.line, location.column)
    }

    fn internal(&self, message: &str, node: &Node) -> CompilerError {
        let location = node.location();
        CompilerError::internal(message, &node.describe(), location.line, location.column)
    }

    /// Emit a whole value tree, optionally under stack-balance
    /// verification, and check that no scratch local stayed rented.
    pub fn emit_root(
        &mut self,
        emitter: &mut dyn CodeEmitter,
        node: &Node,
    ) -> Result<XamlType, CompilerError> {
        let produced = if self.options.verify_stack_balance {
            let mut checked = CheckedEmitter::new(
                emitter,
                0,
                1,
                false,
                &self.file,
                node.location(),
            );
            let produced = self.emit_value(&mut checked, node)?;
            checked.finish()?;
            produced
        } else {
            self.emit_value(emitter, node)?
        };
        if self.pool.outstanding() != 0 {
            return Err(self.internal("scratch locals still rented after emission", node));
        }
        Ok(produced)
    }

    /// Emit one value node; pushes exactly one value and returns its
    /// static type.
    pub fn emit_value(
        &mut self,
        emitter: &mut dyn CodeEmitter,
        node: &Node,
    ) -> Result<XamlType, CompilerError> {
        let wk = self.well_known;
        match node {
            Node::NewObject(n) => {
                let parameters = n.constructor.parameters();
                for (argument, parameter) in n.arguments.iter().zip(parameters.iter()) {
                    self.emit_value_into(emitter, argument, parameter)?;
                }
                emitter.emit(Instruction::Newobj(n.constructor.clone()));
                Ok(n.ty.clone())
            }
            Node::Text(t) => {
                let ty = t.ty.clone().unwrap_or_else(|| wk.string.clone());
                if ty == wk.string {
                    emitter.emit(Instruction::Ldstr(t.text.clone()));
                } else if ty == wk.int32 {
                    let value = t.text.trim().parse::<i32>().map_err(|_| {
                        self.internal("int-typed text no longer parses", node)
                    })?;
                    emitter.emit(Instruction::LdcI4(value));
                } else if ty == wk.double {
                    let value = t.text.trim().parse::<f64>().map_err(|_| {
                        self.internal("double-typed text no longer parses", node)
                    })?;
                    emitter.emit(Instruction::LdcR8(value));
                } else if ty == wk.boolean {
                    let value = t.text.trim().eq_ignore_ascii_case("true");
                    emitter.emit(Instruction::LdcI4(if value { 1 } else { 0 }));
                } else {
                    return Err(self.internal("text carries an unemittable type", node));
                }
                Ok(ty)
            }
            Node::Null(n) => {
                emitter.emit(Instruction::Ldnull);
                Ok(n.ty.clone())
            }
            Node::TypeLiteral(t) => match t.type_reference.as_ref() {
                Node::ClrType(r) => {
                    emitter.emit(Instruction::LdType(r.ty.clone()));
                    Ok(t.literal_type.clone())
                }
                other => Err(self.error(
                    ERR_TYPE_UNRESOLVED,
                    &format!("unresolved {} reached emission", other.describe()),
                    t.location,
                )),
            },
            Node::ValueWithManipulations(v) => {
                let ty = self.emit_value(emitter, &v.value)?;
                match self.parent_hooks.clone() {
                    Some(hooks) => {
                        let scratch = self.pool.rent(emitter, &ty);
                        emitter.emit(Instruction::Stloc(scratch.local()));
                        emitter.emit(Instruction::Ldloc(hooks.context_local));
                        emitter.emit(Instruction::Ldloc(scratch.local()));
                        if ty.is_value_type() {
                            emitter.emit(Instruction::Box(ty.clone()));
                        }
                        emitter.emit(Instruction::Callvirt(hooks.push.clone()));
                        emitter.emit(Instruction::Ldloc(scratch.local()));
                        emitter.emit(Instruction::Dup);
                        self.emit_manipulation(emitter, &v.manipulation, &ty)?;
                        emitter.emit(Instruction::Ldloc(hooks.context_local));
                        emitter.emit(Instruction::Callvirt(hooks.pop));
                    }
                    None => {
                        emitter.emit(Instruction::Dup);
                        self.emit_manipulation(emitter, &v.manipulation, &ty)?;
                    }
                }
                Ok(ty)
            }
            Node::MarkupExtension(m) => {
                self.emit_value(emitter, &m.value)?;
                if m.provide_value.returns_void() {
                    return Err(self.internal("ProvideValue returns nothing", node));
                }
                if m.provide_value.parameters().len() == 1 {
                    match self.service_provider {
                        Some(local) => emitter.emit(Instruction::Ldloc(local)),
                        None => emitter.emit(Instruction::Ldnull),
                    }
                }
                emitter.emit(Instruction::Callvirt(m.provide_value.clone()));
                Ok(m.provide_value.return_type())
            }
            Node::DeferredContent(d) => {
                let factory = self.build_deferred_factory(node, &d.value)?;
                emitter.emit(Instruction::LdFactory(factory.clone()));
                Ok(factory.return_type())
            }
            Node::LocalValue(l) => {
                let ty = l
                    .value
                    .value_type_or(&wk.string)
                    .ok_or_else(|| self.internal("compiler local has no value type", node))?;
                let local = emitter.define_local(&ty);
                self.emit_value(emitter, &l.value)?;
                emitter.emit(Instruction::Stloc(local));
                emitter.emit(Instruction::Ldloc(local));
                self.bound.insert(l.local_id, local);
                Ok(ty)
            }
            Node::Object(o) => Err(self.error(
                ERR_TYPE_UNRESOLVED,
                &format!("unresolved {} reached emission", o.type_reference.describe()),
                o.location,
            )),
            other => Err(self.internal("node is not a value", other)),
        }
    }

    /// Emit one manipulation node. The target value is on the stack and is
    /// consumed.
    pub fn emit_manipulation(
        &mut self,
        emitter: &mut dyn CodeEmitter,
        node: &Node,
        target_type: &XamlType,
    ) -> Result<(), CompilerError> {
        match node {
            Node::Assignment(a) => self.emit_assignment(emitter, a),
            Node::MethodCall(c) => {
                let parameters = c.method.parameters();
                let skip = if c.method.is_static() { 1 } else { 0 };
                // For a static method the target on the stack is its first
                // argument.
                for (argument, parameter) in
                    c.arguments.iter().zip(parameters.iter().skip(skip))
                {
                    self.emit_value_into(emitter, argument, parameter)?;
                }
                if c.method.is_static() {
                    emitter.emit(Instruction::Call(c.method.clone()));
                } else {
                    emitter.emit(Instruction::Callvirt(c.method.clone()));
                }
                if !c.method.returns_void() {
                    emitter.emit(Instruction::Pop);
                }
                Ok(())
            }
            Node::ManipulationGroup(g) => {
                if g.children.is_empty() {
                    emitter.emit(Instruction::Pop);
                    return Ok(());
                }
                let last = g.children.len() - 1;
                for (index, child) in g.children.iter().enumerate() {
                    if index < last {
                        emitter.emit(Instruction::Dup);
                    }
                    self.emit_manipulation(emitter, child, target_type)?;
                }
                Ok(())
            }
            Node::ObjectInitialization(init) => {
                self.emit_manipulation(emitter, &init.manipulation, &init.ty)
            }
            Node::LocalManipulation(l) => {
                // The group target is not this manipulation's target.
                emitter.emit(Instruction::Pop);
                let local = *self.bound.get(&l.local_id).ok_or_else(|| {
                    self.internal("manipulation of an unbound compiler local", node)
                })?;
                emitter.emit(Instruction::Ldloc(local));
                self.emit_manipulation(emitter, &l.manipulation, target_type)
            }
            Node::NameProperty(p) => Err(self.error(
                ERR_PROPERTY_UNRESOLVED,
                &format!("unresolved property reference '{}' reached emission", p.name),
                p.location,
            )),
            other => Err(self.internal("node is not a manipulation", other)),
        }
    }

    fn emit_assignment(
        &mut self,
        emitter: &mut dyn CodeEmitter,
        assignment: &AssignmentNode,
    ) -> Result<(), CompilerError> {
        let wk = self.well_known;
        let value = assignment
            .arguments
            .last()
            .ok_or_else(|| {
                CompilerError::internal(
                    "assignment without a value argument",
                    &format!("assignment to '{}'", assignment.property.name()),
                    assignment.location.line,
                    assignment.location.column,
                )
            })?;
        let value_type = value.value_type_or(&wk.string);
        let setter = choose_setter(&assignment.setters, value_type.as_ref()).ok_or_else(|| {
            CompilerError::internal(
                "assignment survived selection with no setter",
                &format!("assignment to '{}'", assignment.property.name()),
                assignment.location.line,
                assignment.location.column,
            )
        })?;

        match &setter.kind {
            SetterKind::Instance(set) | SetterKind::EventAdd(set) => {
                self.emit_arguments(emitter, &assignment.arguments, &setter.parameters)?;
                emitter.emit(Instruction::Callvirt(set.clone()));
                if !set.returns_void() {
                    emitter.emit(Instruction::Pop);
                }
            }
            SetterKind::AttachedStatic(set) => {
                // Target on the stack doubles as the first static argument.
                self.emit_arguments(emitter, &assignment.arguments, &setter.parameters)?;
                emitter.emit(Instruction::Call(set.clone()));
                if !set.returns_void() {
                    emitter.emit(Instruction::Pop);
                }
            }
            SetterKind::Adder { getter, add } => {
                emitter.emit(Instruction::Callvirt(getter.clone()));
                self.emit_arguments(emitter, &assignment.arguments, &setter.parameters)?;
                emitter.emit(Instruction::Callvirt(add.clone()));
                if !add.returns_void() {
                    emitter.emit(Instruction::Pop);
                }
            }
        }
        Ok(())
    }

    fn emit_arguments(
        &mut self,
        emitter: &mut dyn CodeEmitter,
        arguments: &[Node],
        parameters: &[XamlType],
    ) -> Result<(), CompilerError> {
        for (argument, parameter) in arguments.iter().zip(parameters.iter()) {
            self.emit_value_into(emitter, argument, parameter)?;
        }
        Ok(())
    }

    /// Emit a value and convert it to the target slot type.
    pub fn emit_value_into(
        &mut self,
        emitter: &mut dyn CodeEmitter,
        node: &Node,
        target: &XamlType,
    ) -> Result<(), CompilerError> {
        if let Node::Null(_) = node {
            if !target.is_value_type() {
                emitter.emit(Instruction::Ldnull);
                return Ok(());
            }
            if target.nullable_inner().is_some() {
                let scratch = self.pool.rent(emitter, target);
                emitter.emit(Instruction::Ldloca(scratch.local()));
                emitter.emit(Instruction::Initobj(target.clone()));
                emitter.emit(Instruction::Ldloc(scratch.local()));
                return Ok(());
            }
            return Err(self.error(
                ERR_CONVERSION,
                &format!("null cannot become the value type '{}'", target.full_name()),
                node.location(),
            ));
        }

        let from = self.emit_value(emitter, node)?;
        self.emit_convert(emitter, &from, target, node.location())
    }

    fn emit_convert(
        &mut self,
        emitter: &mut dyn CodeEmitter,
        from: &XamlType,
        target: &XamlType,
        location: SourceLocation,
    ) -> Result<(), CompilerError> {
        let wk = self.well_known;
        if from == target {
            return Ok(());
        }
        // T -> Nullable<T>
        if target.nullable_inner().as_ref() == Some(from) {
            let ctor = target
                .constructors()
                .into_iter()
                .find(|c| c.parameters().len() == 1)
                .ok_or_else(|| {
                    CompilerError::internal(
                        "nullable type lost its wrapping constructor",
                        &target.full_name(),
                        location.line,
                        location.column,
                    )
                })?;
            emitter.emit(Instruction::Newobj(ctor));
            return Ok(());
        }
        // Nullable<T> -> T
        if from.nullable_inner().as_ref() == Some(target) {
            let get_value = from.find_method("get_Value", 0).ok_or_else(|| {
                CompilerError::internal(
                    "nullable type lost get_Value",
                    &from.full_name(),
                    location.line,
                    location.column,
                )
            })?;
            let scratch = self.pool.rent(emitter, from);
            emitter.emit(Instruction::Stloc(scratch.local()));
            emitter.emit(Instruction::Ldloca(scratch.local()));
            emitter.emit(Instruction::Call(get_value));
            return Ok(());
        }
        if from.is_value_type() && target == &wk.object {
            emitter.emit(Instruction::Box(from.clone()));
            return Ok(());
        }
        if target.is_value_type() && from == &wk.object {
            emitter.emit(Instruction::UnboxAny(target.clone()));
            return Ok(());
        }
        if from.is_value_type() || target.is_value_type() {
            return Err(self.error(
                ERR_CONVERSION,
                &format!(
                    "no conversion from '{}' to '{}'",
                    from.full_name(),
                    target.full_name()
                ),
                location,
            ));
        }
        // Reference conversions.
        if target.is_assignable_from(from) {
            return Ok(());
        }
        if from.is_assignable_from(target) || target.is_interface() || from.is_interface() {
            emitter.emit(Instruction::Castclass(target.clone()));
            return Ok(());
        }
        Err(self.error(
            ERR_CONVERSION,
            &format!(
                "'{}' and '{}' are unrelated reference types",
                from.full_name(),
                target.full_name()
            ),
            location,
        ))
    }

    fn build_deferred_factory(
        &mut self,
        node: &Node,
        value: &Node,
    ) -> Result<XamlMethod, CompilerError> {
        let host = self
            .deferred
            .ok_or_else(|| self.internal("deferred content without a factory host", node))?;
        let value_type = value
            .value_type_or(&self.well_known.string)
            .unwrap_or_else(|| self.well_known.object.clone());
        let index = host.owner.methods().len();
        let method = host.builder.define_method(
            host.owner,
            &format!("BuildDeferred_{}", index),
            &value_type,
            &[],
            true,
        );
        let mut recording = RecordingEmitter::new();
        let mut sub = EmitContext::new(self.well_known, self.options, &self.file);
        sub.deferred = self.deferred;
        if self.options.verify_stack_balance {
            let mut checked = CheckedEmitter::new(
                &mut recording,
                0,
                0,
                true,
                &self.file,
                value.location(),
            );
            sub.emit_value(&mut checked, value)?;
            checked.emit(Instruction::Ret);
            checked.finish()?;
        } else {
            sub.emit_value(&mut recording, value)?;
            recording.emit(Instruction::Ret);
        }
        host.builder
            .set_method_body(&method, recording.into_instructions());
        Ok(method)
    }
}

/// First setter whose value slot statically accepts the value's type;
/// falls back to the first surviving candidate, whose conversion is then
/// checked during argument emission.
fn choose_setter<'s>(
    setters: &'s [PropertySetter],
    value_type: Option<&XamlType>,
) -> Option<&'s PropertySetter> {
    if let Some(value_type) = value_type {
        if let Some(found) = setters.iter().find(|s| {
            s.parameters
                .last()
                .map(|p| p.is_assignable_from(value_type))
                .unwrap_or(false)
        }) {
            return Some(found);
        }
    }
    setters.first()
}
