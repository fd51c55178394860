//! End-to-end emission tests: parse, pipeline, loader generation against
//! the in-memory backend, all under stack-balance verification.

use crate::il::Instruction;
use crate::transform::CompilerConfig;
use crate::types::{InMemoryTypeSystem, TypeBuilder, TypeKind, TypeSystem, XamlType};
use crate::{compile_document, emit_document, EmittedDocument};

const TEST_NS: &str = "clr-test://app";

struct World {
    ts: InMemoryTypeSystem,
    config: CompilerConfig,
    root: XamlType,
    item: XamlType,
}

fn world() -> World {
    let ts = InMemoryTypeSystem::with_core_types();
    let object = ts.find_type("System.Object").unwrap();
    let string = ts.find_type("System.String").unwrap();
    let int32 = ts.find_type("System.Int32").unwrap();
    let void = ts.find_type("System.Void").unwrap();

    let item = ts.define_type("App", "App", "Item", TypeKind::Class, Some(&object));
    ts.define_constructor(&item, &[]);
    ts.add_auto_property(&item, "Text", &string, true, true);

    let items = ts.define_type("App", "App", "ItemCollection", TypeKind::Class, Some(&object));
    ts.define_constructor(&items, &[]);
    ts.define_method(&items, "Add", &void, &[item.clone()], false);

    let root = ts.define_type("App", "App", "Root", TypeKind::Class, Some(&object));
    ts.define_constructor(&root, &[]);
    ts.add_auto_property(&root, "Items", &items, true, false);
    ts.add_auto_property(&root, "Title", &string, true, true);
    ts.add_auto_property(&root, "Count", &int32, true, true);

    let mut config = CompilerConfig::new();
    config.map_namespace(TEST_NS, "App", Some("App"));
    config.options.verify_stack_balance = true;
    World { ts, config, root, item }
}

fn emit(world: &World, source: &str) -> EmittedDocument {
    let document = compile_document(source, "main.xaml", &world.config, &world.ts).unwrap();
    emit_document(&document, &world.config, &world.ts).unwrap()
}

fn callvirt_names(body: &[Instruction]) -> Vec<String> {
    body.iter()
        .filter_map(|i| match i {
            Instruction::Callvirt(m) => Some(m.name().to_string()),
            _ => None,
        })
        .collect()
}

#[test]
fn build_constructs_and_populate_reuses() {
    let w = world();
    let emitted = emit(
        &w,
        &format!(r#"<Root xmlns="{TEST_NS}"><Root.Items><Item/><Item/></Root.Items></Root>"#),
    );
    assert!(emitted.loader_type.name().starts_with("XamlLoader_"));
    assert!(emitted.context.context_type.name().starts_with("XamlContext_"));

    let build = emitted.build.body().unwrap();
    assert!(matches!(build.last(), Some(Instruction::Ret)));
    let root_constructions = build
        .iter()
        .filter(|i| {
            matches!(i, Instruction::Newobj(c)
                if c.declaring_type().as_ref() == Some(&w.root))
        })
        .count();
    assert_eq!(root_constructions, 1);
    let calls = callvirt_names(&build);
    assert_eq!(calls.iter().filter(|n| *n == "Add").count(), 2);
    assert_eq!(calls.iter().filter(|n| *n == "get_Items").count(), 2);

    // Populate works on the caller's instance: the root constructor never
    // runs, only the context constructor does.
    let populate = emitted.populate.body().unwrap();
    assert!(matches!(populate.last(), Some(Instruction::Ret)));
    assert!(!populate.iter().any(|i| {
        matches!(i, Instruction::Newobj(c)
            if c.declaring_type().as_ref() == Some(&w.root))
    }));
    assert_eq!(callvirt_names(&populate).iter().filter(|n| *n == "Add").count(), 2);
}

#[test]
fn typed_attributes_emit_typed_loads() {
    let w = world();
    let emitted = emit(
        &w,
        &format!(r#"<Root xmlns="{TEST_NS}" Title="hello" Count="42"/>"#),
    );
    let build = emitted.build.body().unwrap();
    assert!(build.iter().any(|i| matches!(i, Instruction::LdcI4(42))));
    assert!(build
        .iter()
        .any(|i| matches!(i, Instruction::Ldstr(s) if s == "hello")));
    let calls = callvirt_names(&build);
    assert!(calls.contains(&"set_Title".to_string()));
    assert!(calls.contains(&"set_Count".to_string()));
}

#[test]
fn nested_objects_with_manipulations_ride_the_parent_stack() {
    let w = world();
    let emitted = emit(
        &w,
        &format!(
            r#"<Root xmlns="{TEST_NS}"><Root.Items><Item Text="a"/></Root.Items></Root>"#
        ),
    );
    let build = emitted.build.body().unwrap();
    let calls = callvirt_names(&build);
    let pushes = calls.iter().filter(|n| *n == "PushParent").count();
    let pops = calls.iter().filter(|n| *n == "PopParent").count();
    assert_eq!(pushes, 1);
    assert_eq!(pops, 1);
    assert!(calls.contains(&"set_Text".to_string()));
}

#[test]
fn markup_extension_calls_provide_value_and_casts() {
    let w = world();
    let object = w.ts.find_type("System.Object").unwrap();
    let string = w.ts.find_type("System.String").unwrap();
    let sp = w.ts.find_type("System.IServiceProvider").unwrap();
    let ext = w
        .ts
        .define_type("App", "App", "StaticExtension", TypeKind::Class, Some(&object));
    w.ts.define_constructor(&ext, &[]);
    w.ts.add_auto_property(&ext, "Member", &string, true, true);
    w.ts.define_method(&ext, "ProvideValue", &object, &[sp], false);

    let emitted = emit(
        &w,
        &format!(r#"<Root xmlns="{TEST_NS}" Title="{{Static Member=Red}}"/>"#),
    );
    let build = emitted.build.body().unwrap();
    let calls = callvirt_names(&build);
    assert!(calls.contains(&"ProvideValue".to_string()));
    assert!(build
        .iter()
        .any(|i| matches!(i, Instruction::Castclass(t) if t == &string)));
    assert!(calls.contains(&"set_Title".to_string()));
}

#[test]
fn deferred_content_lands_as_a_factory_on_the_loader() {
    let w = world();
    let template = w.ts.add_auto_property(&w.root, "Template", &w.item, true, true);
    w.ts.add_property_attribute(&template, &w.config.deferred_content_attribute);

    let emitted = emit(
        &w,
        &format!(r#"<Root xmlns="{TEST_NS}"><Root.Template><Item/></Root.Template></Root>"#),
    );
    let build = emitted.build.body().unwrap();
    let Some(Instruction::LdFactory(factory)) = build
        .iter()
        .find(|i| matches!(i, Instruction::LdFactory(_)))
    else {
        panic!("deferred content should load a factory");
    };
    assert_eq!(factory.declaring_type().as_ref(), Some(&emitted.loader_type));
    let factory_body = factory.body().unwrap();
    assert!(matches!(factory_body.last(), Some(Instruction::Ret)));
    assert!(factory_body
        .iter()
        .any(|i| matches!(i, Instruction::Newobj(c)
            if c.declaring_type().as_ref() == Some(&w.item))));
}

#[test]
fn unresolved_root_cannot_be_emitted() {
    let w = world();
    let mut lax = w.config.clone();
    lax.options.strict = false;
    let document =
        compile_document(&format!(r#"<Bogus xmlns="{TEST_NS}"/>"#), "main.xaml", &lax, &w.ts)
            .unwrap();
    let err = emit_document(&document, &lax, &w.ts).unwrap_err();
    assert_eq!(err.code, crate::diagnostics::ERR_TYPE_UNRESOLVED);
}
