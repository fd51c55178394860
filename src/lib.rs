//! # XAML Compiler Core
//!
//! ## Pipeline Invariants
//!
//! 1. **Single container**: the loosely-typed `Node` tree is the ONLY
//!    representation between parsing and emission. Every pass consumes and
//!    produces the same tree shape; no pass keeps private side tables.
//!
//! 2. **Pass ordering**: passes run in the fixed order of
//!    `default_pipeline`. Directives are recognized before constructor
//!    arguments, types resolve before properties, properties before
//!    content wrapping, assignments before object resolution, and
//!    flattening runs last. Reordering breaks the downstream passes'
//!    preconditions.
//!
//! 3. **Resolution one-way street**: once a reference node (`XmlType`,
//!    `NameProperty`) is replaced by its resolved form (`ClrType`,
//!    `ClrProperty`, `Assignment`), no pass reintroduces the unresolved
//!    form. An unresolved reference surviving to emission fails there with
//!    the same error resolution would have raised in strict mode.
//!
//! 4. **Value/manipulation discipline**: a value node pushes exactly one
//!    value when emitted; a manipulation node consumes exactly one. The
//!    optional stack-balance verifier enforces this mechanically; a
//!    violation is a compiler defect, never a markup error.
//!
//! 5. **Identity equality**: type-system handles compare by identity.
//!    Backends memoize lookups, so the same query yields the same handle
//!    and `==` on handles is meaningful everywhere.

pub mod ast;
pub mod checked_emit;
pub mod content;
pub mod context;
pub mod diagnostics;
pub mod emit;
pub mod extensions;
pub mod il;
pub mod lowering;
pub mod parse;
pub mod resolver;
pub mod transform;
pub mod types;
pub mod visitor;

pub use ast::{Document, Node, SourceLocation};
pub use diagnostics::CompilerError;
pub use emit::{DeferredHost, EmitContext, ParentHooks};
pub use parse::parse_document;
pub use transform::{
    default_pipeline, run_pipeline, CompileOptions, CompilerConfig, TransformContext,
};
pub use types::{
    InMemoryTypeSystem, TypeBuilder, TypeSystem, WellKnownTypes, XamlMethod, XamlType,
};

use checked_emit::CheckedEmitter;
use context::RuntimeContextScheme;
use diagnostics::ERR_TYPE_UNRESOLVED;
use il::{CodeEmitter, Instruction, Local, RecordingEmitter};

// ═══════════════════════════════════════════════════════════════════════════════
// DRIVERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse one markup document and run the full transformation pipeline over
/// it. The returned document's root is the resolved plan emission expects.
pub fn compile_document(
    source: &str,
    file: &str,
    config: &CompilerConfig,
    type_system: &dyn TypeSystem,
) -> Result<Document, CompilerError> {
    let well_known = WellKnownTypes::resolve(type_system)?;
    let mut document = parse_document(source, file, config)?;
    let aliases = document.namespace_aliases.clone();
    let mut ctx = TransformContext::new(config, type_system, &well_known, &aliases, file);
    run_pipeline(&mut document, &mut ctx)?;
    tracing::debug!(file, "document compiled");
    Ok(document)
}

/// The generated output surface for one document: the loader type with its
/// two entry points, plus the synthesized runtime-context type.
#[derive(Debug)]
pub struct EmittedDocument {
    pub loader_type: XamlType,
    /// `Build(serviceProvider)` → new root instance.
    pub build: XamlMethod,
    /// `Populate(serviceProvider, instance)` → void.
    pub populate: XamlMethod,
    pub context: RuntimeContextScheme,
}

/// Generate the loader type for a compiled document into `builder`.
pub fn emit_document(
    document: &Document,
    config: &CompilerConfig,
    builder: &dyn TypeBuilder,
) -> Result<EmittedDocument, CompilerError> {
    let type_system: &dyn TypeSystem = builder;
    let well_known = WellKnownTypes::resolve(type_system)?;

    let (construction, manipulation) = match &document.root {
        Node::ValueWithManipulations(v) => (v.value.as_ref(), Some(v.manipulation.as_ref())),
        other => (other, None),
    };
    let root_type = construction.value_type().ok_or_else(|| {
        let location = document.root.location();
        CompilerError::new(
            ERR_TYPE_UNRESOLVED,
            &format!(
                "document root {} is not a resolved object",
                document.root.describe()
            ),
            &document.file,
            location.line,
            location.column,
        )
    })?;

    let scheme = context::build_runtime_context(builder, &well_known, &root_type, &document.file)?;
    let service_provider = well_known
        .service_provider
        .clone()
        .unwrap_or_else(|| well_known.object.clone());

    let loader_type = builder.define_type(
        root_type.assembly_name(),
        root_type.namespace(),
        &format!("XamlLoader_{}", context::identifier_stem(&document.file)),
        types::TypeKind::Class,
        Some(&well_known.object),
    );

    let build = builder.define_method(
        &loader_type,
        "Build",
        &root_type,
        &[service_provider.clone()],
        true,
    );
    let populate = builder.define_method(
        &loader_type,
        "Populate",
        &well_known.void,
        &[service_provider, root_type.clone()],
        true,
    );

    // Build(sp): construct the root, wire the context, run manipulations,
    // return the root.
    let build_body = {
        let mut recording = RecordingEmitter::new();
        emit_body(
            config,
            &mut recording,
            true,
            document,
            builder,
            &loader_type,
            &well_known,
            |emitter, emit_ctx| {
                let root_local = emitter.define_local(&root_type);
                let context_local = emitter.define_local(&scheme.context_type);
                let ref_root = !root_type.is_value_type();
                if ref_root {
                    // The context exists before construction so markup
                    // extensions inside constructor arguments can already
                    // locate services; the root field is patched after.
                    emitter.emit(Instruction::Ldnull);
                    emitter.emit(Instruction::Ldarg(0));
                    emitter.emit(Instruction::Newobj(scheme.constructor.clone()));
                    emitter.emit(Instruction::Stloc(context_local));
                    configure(emit_ctx, context_local, &scheme);
                }
                emit_ctx.emit_value(emitter, construction)?;
                emitter.emit(Instruction::Stloc(root_local));
                if ref_root {
                    emitter.emit(Instruction::Ldloc(context_local));
                    emitter.emit(Instruction::Ldloc(root_local));
                    emitter.emit(Instruction::Stfld(scheme.root_field.clone()));
                } else {
                    emitter.emit(Instruction::Ldloc(root_local));
                    emitter.emit(Instruction::Ldarg(0));
                    emitter.emit(Instruction::Newobj(scheme.constructor.clone()));
                    emitter.emit(Instruction::Stloc(context_local));
                    configure(emit_ctx, context_local, &scheme);
                }
                if let Some(manipulation) = manipulation {
                    emitter.emit(Instruction::Ldloc(root_local));
                    emit_ctx.emit_manipulation(emitter, manipulation, &root_type)?;
                }
                emitter.emit(Instruction::Ldloc(root_local));
                emitter.emit(Instruction::Ret);
                Ok(())
            },
        )?;
        recording.into_instructions()
    };
    builder.set_method_body(&build, build_body);

    // Populate(sp, instance): wire the context around the existing
    // instance, then run manipulations against it.
    let populate_body = {
        let mut recording = RecordingEmitter::new();
        emit_body(
            config,
            &mut recording,
            false,
            document,
            builder,
            &loader_type,
            &well_known,
            |emitter, emit_ctx| {
                let context_local = emitter.define_local(&scheme.context_type);
                emitter.emit(Instruction::Ldarg(1));
                emitter.emit(Instruction::Ldarg(0));
                emitter.emit(Instruction::Newobj(scheme.constructor.clone()));
                emitter.emit(Instruction::Stloc(context_local));
                configure(emit_ctx, context_local, &scheme);
                if let Some(manipulation) = manipulation {
                    emitter.emit(Instruction::Ldarg(1));
                    emit_ctx.emit_manipulation(emitter, manipulation, &root_type)?;
                }
                emitter.emit(Instruction::Ret);
                Ok(())
            },
        )?;
        recording.into_instructions()
    };
    builder.set_method_body(&populate, populate_body);

    tracing::debug!(
        file = document.file.as_str(),
        loader = loader_type.name(),
        "document emitted"
    );
    Ok(EmittedDocument {
        loader_type,
        build,
        populate,
        context: scheme,
    })
}

fn configure(emit_ctx: &mut EmitContext<'_>, context_local: Local, scheme: &RuntimeContextScheme) {
    emit_ctx.set_runtime_context(
        context_local,
        ParentHooks {
            context_local,
            push: scheme.push_parent.clone(),
            pop: scheme.pop_parent.clone(),
        },
    );
}

/// Run one entry-point body generator, optionally under stack-balance
/// verification.
fn emit_body<'a>(
    config: &'a CompilerConfig,
    recording: &mut RecordingEmitter,
    returns_value: bool,
    document: &'a Document,
    builder: &'a dyn TypeBuilder,
    loader_type: &'a XamlType,
    well_known: &'a WellKnownTypes,
    fill: impl FnOnce(&mut dyn CodeEmitter, &mut EmitContext<'a>) -> Result<(), CompilerError>,
) -> Result<(), CompilerError> {
    let mut emit_ctx = EmitContext::new(well_known, &config.options, &document.file)
        .with_deferred_host(DeferredHost {
            builder,
            owner: loader_type,
        });
    if config.options.verify_stack_balance {
        let mut checked = CheckedEmitter::new(
            recording,
            0,
            0,
            returns_value,
            &document.file,
            document.root.location(),
        );
        fill(&mut checked, &mut emit_ctx)?;
        checked.finish()
    } else {
        fill(recording, &mut emit_ctx)
    }
}

#[cfg(test)]
mod pipeline_tests;

#[cfg(test)]
mod emit_tests;
