//! Runtime-context type synthesis.
//!
//! Every compiled document gets one support type, instantiated at load
//! time and threaded through the generated population code. It carries the
//! root object, a parent stack the emitted code pushes and pops at
//! manipulation boundaries, the chained parent service provider, and the
//! document base URI. Its `GetService` scans the local state by runtime
//! type compatibility before delegating outward, so markup extensions see
//! their lexical ancestor chain at load time the same way transformers saw
//! it statically.

use crate::checked_emit::CheckedEmitter;
use crate::diagnostics::{CompilerError, ERR_TYPE_UNRESOLVED};
use crate::il::{CodeEmitter, Instruction, RecordingEmitter};
use crate::types::{
    TypeBuilder, TypeSystem, WellKnownTypes, XamlConstructor, XamlField, XamlMethod, XamlType,
};
use crate::ast::SourceLocation;

// ═══════════════════════════════════════════════════════════════════════════════
// SCHEME
// ═══════════════════════════════════════════════════════════════════════════════

/// Handles to the synthesized context type's members, in the shape the
/// emitter needs when wiring population code.
#[derive(Debug)]
pub struct RuntimeContextScheme {
    pub context_type: XamlType,
    pub constructor: XamlConstructor,
    pub root_field: XamlField,
    pub parents_field: XamlField,
    pub parent_provider_field: XamlField,
    pub push_parent: XamlMethod,
    pub pop_parent: XamlMethod,
    pub get_service: XamlMethod,
    pub get_root: XamlMethod,
    pub get_base_uri: XamlMethod,
    pub set_base_uri: XamlMethod,
}

fn missing_core(name: &str) -> CompilerError {
    CompilerError::new(
        ERR_TYPE_UNRESOLVED,
        &format!("core type '{}' is missing from the metadata backend", name),
        "",
        0,
        0,
    )
}

/// The document file's stem, reduced to identifier-safe characters.
pub fn identifier_stem(document: &str) -> String {
    let stem = document
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(document)
        .split('.')
        .next()
        .unwrap_or(document);
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// A context type name derived from the document file name.
pub fn context_type_name(document: &str) -> String {
    format!("XamlContext_{}", identifier_stem(document))
}

// ═══════════════════════════════════════════════════════════════════════════════
// SYNTHESIS
// ═══════════════════════════════════════════════════════════════════════════════

/// Define the context type for one document and fill in every method body.
/// Bodies are generated under stack-balance verification; a failure there
/// is a defect in this generator, not in the markup.
pub fn build_runtime_context(
    builder: &dyn TypeBuilder,
    wk: &WellKnownTypes,
    root_type: &XamlType,
    document: &str,
) -> Result<RuntimeContextScheme, CompilerError> {
    let service_provider = wk
        .service_provider
        .clone()
        .ok_or_else(|| missing_core("System.IServiceProvider"))?;
    let list_definition = builder
        .find_type("System.Collections.Generic.List`1")
        .ok_or_else(|| missing_core("System.Collections.Generic.List`1"))?;
    let parents_type = builder
        .make_generic(&list_definition, &[wk.object.clone()])
        .ok_or_else(|| missing_core("System.Collections.Generic.List`1"))?;
    let parents_ctor = parents_type
        .constructors()
        .into_iter()
        .find(|c| c.parameters().is_empty())
        .ok_or_else(|| missing_core("List`1..ctor"))?;
    let parents_add = parents_type
        .find_method("Add", 1)
        .ok_or_else(|| missing_core("List`1.Add"))?;
    let parents_count = parents_type
        .find_method("get_Count", 0)
        .ok_or_else(|| missing_core("List`1.get_Count"))?;
    let parents_remove_at = parents_type
        .find_method("RemoveAt", 1)
        .ok_or_else(|| missing_core("List`1.RemoveAt"))?;
    let is_instance_of = wk
        .system_type
        .find_method("IsInstanceOfType", 1)
        .ok_or_else(|| missing_core("System.Type.IsInstanceOfType"))?;
    let provider_get_service = service_provider
        .find_method("GetService", 1)
        .ok_or_else(|| missing_core("IServiceProvider.GetService"))?;

    let context_type = builder.define_type(
        root_type.assembly_name(),
        root_type.namespace(),
        &context_type_name(document),
        crate::types::TypeKind::Class,
        Some(&wk.object),
    );
    builder.add_interface_implementation(&context_type, &service_provider);

    let root_field = builder.define_field(&context_type, "Root", root_type, false);
    let parents_field = builder.define_field(&context_type, "Parents", &parents_type, false);
    let parent_provider_field =
        builder.define_field(&context_type, "ParentServiceProvider", &service_provider, false);
    let base_uri_field = builder.define_field(&context_type, "BaseUri", &wk.string, false);

    // .ctor(root, parentServiceProvider)
    let constructor = builder.define_constructor(
        &context_type,
        &[root_type.clone(), service_provider.clone()],
    );
    builder.set_constructor_body(
        &constructor,
        vec![
            Instruction::Ldarg(0),
            Instruction::Newobj(parents_ctor),
            Instruction::Stfld(parents_field.clone()),
            Instruction::Ldarg(0),
            Instruction::Ldarg(1),
            Instruction::Stfld(root_field.clone()),
            Instruction::Ldarg(0),
            Instruction::Ldarg(2),
            Instruction::Stfld(parent_provider_field.clone()),
            Instruction::Ret,
        ],
    );

    let push_parent = builder.define_method(
        &context_type,
        "PushParent",
        &wk.void,
        &[wk.object.clone()],
        false,
    );
    builder.set_method_body(
        &push_parent,
        body_recorder(false, |e| {
            e.emit(Instruction::Ldarg(0));
            e.emit(Instruction::Ldfld(parents_field.clone()));
            e.emit(Instruction::Ldarg(1));
            e.emit(Instruction::Callvirt(parents_add.clone()));
            e.emit(Instruction::Ret);
        })?,
    );

    let pop_parent = builder.define_method(&context_type, "PopParent", &wk.void, &[], false);
    builder.set_method_body(
        &pop_parent,
        body_recorder(false, |e| {
            e.emit(Instruction::Ldarg(0));
            e.emit(Instruction::Ldfld(parents_field.clone()));
            e.emit(Instruction::Dup);
            e.emit(Instruction::Callvirt(parents_count.clone()));
            e.emit(Instruction::LdcI4(1));
            e.emit(Instruction::Sub);
            e.emit(Instruction::Callvirt(parents_remove_at.clone()));
            e.emit(Instruction::Ret);
        })?,
    );

    let get_root = builder.define_method(&context_type, "get_Root", root_type, &[], false);
    builder.set_method_body(
        &get_root,
        body_recorder(true, |e| {
            e.emit(Instruction::Ldarg(0));
            e.emit(Instruction::Ldfld(root_field.clone()));
            e.emit(Instruction::Ret);
        })?,
    );
    builder.define_property(&context_type, "Root", root_type, Some(&get_root), None);

    let get_base_uri = builder.define_method(&context_type, "get_BaseUri", &wk.string, &[], false);
    builder.set_method_body(
        &get_base_uri,
        body_recorder(true, |e| {
            e.emit(Instruction::Ldarg(0));
            e.emit(Instruction::Ldfld(base_uri_field.clone()));
            e.emit(Instruction::Ret);
        })?,
    );
    let set_base_uri = builder.define_method(
        &context_type,
        "set_BaseUri",
        &wk.void,
        &[wk.string.clone()],
        false,
    );
    builder.set_method_body(
        &set_base_uri,
        body_recorder(false, |e| {
            e.emit(Instruction::Ldarg(0));
            e.emit(Instruction::Ldarg(1));
            e.emit(Instruction::Stfld(base_uri_field.clone()));
            e.emit(Instruction::Ret);
        })?,
    );
    builder.define_property(
        &context_type,
        "BaseUri",
        &wk.string,
        Some(&get_base_uri),
        Some(&set_base_uri),
    );

    // GetService: the root wins when it satisfies the requested type,
    // otherwise the parent provider is consulted, otherwise null.
    let get_service = builder.define_method(
        &context_type,
        "GetService",
        &wk.object,
        &[wk.system_type.clone()],
        false,
    );
    let root_is_value = root_type.is_value_type();
    let root_boxed = root_type.clone();
    builder.set_method_body(
        &get_service,
        body_recorder(true, |e| {
            let not_root = e.define_label();
            let no_parent = e.define_label();
            e.emit(Instruction::Ldarg(1));
            e.emit(Instruction::Ldarg(0));
            e.emit(Instruction::Ldfld(root_field.clone()));
            if root_is_value {
                e.emit(Instruction::Box(root_boxed.clone()));
            }
            e.emit(Instruction::Callvirt(is_instance_of.clone()));
            e.emit(Instruction::Brfalse(not_root));
            e.emit(Instruction::Ldarg(0));
            e.emit(Instruction::Ldfld(root_field.clone()));
            if root_is_value {
                e.emit(Instruction::Box(root_boxed.clone()));
            }
            e.emit(Instruction::Ret);
            e.mark_label(not_root);
            e.emit(Instruction::Ldarg(0));
            e.emit(Instruction::Ldfld(parent_provider_field.clone()));
            e.emit(Instruction::Dup);
            e.emit(Instruction::Brfalse(no_parent));
            e.emit(Instruction::Ldarg(1));
            e.emit(Instruction::Callvirt(provider_get_service.clone()));
            e.emit(Instruction::Ret);
            e.mark_label(no_parent);
            e.emit(Instruction::Pop);
            e.emit(Instruction::Ldnull);
            e.emit(Instruction::Ret);
        })?,
    );

    Ok(RuntimeContextScheme {
        context_type,
        constructor,
        root_field,
        parents_field,
        parent_provider_field,
        push_parent,
        pop_parent,
        get_service,
        get_root,
        get_base_uri,
        set_base_uri,
    })
}

/// Record a method body under stack-balance verification.
fn body_recorder(
    returns_value: bool,
    fill: impl FnOnce(&mut CheckedEmitter<'_>),
) -> Result<Vec<Instruction>, CompilerError> {
    let mut recording = RecordingEmitter::new();
    let mut checked = CheckedEmitter::new(
        &mut recording,
        0,
        0,
        returns_value,
        "<generated>",
        SourceLocation::default(),
    );
    fill(&mut checked);
    checked.finish()?;
    Ok(recording.into_instructions())
}
