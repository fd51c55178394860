//! Scenario tests driving parse + the full pass pipeline against an
//! in-memory metadata world.

use crate::ast::Node;
use crate::diagnostics::{ERR_BIND_NO_SETTER, ERR_TYPE_UNRESOLVED};
use crate::transform::CompilerConfig;
use crate::types::{InMemoryTypeSystem, SetterKind, TypeBuilder, TypeKind, TypeSystem, XamlType};
use crate::{compile_document, Document};

const TEST_NS: &str = "clr-test://app";
const X_NS: &str = "http://schemas.microsoft.com/winfx/2006/xaml";

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

    let items = ts.define_type("App", "App", "ItemCollection", TypeKind::Class, Some(&object));
    ts.define_constructor(&items, &[]);
    ts.define_method(&items, "Add", &void, &[item.clone()], false);

    let resources = ts.define_type("App", "App", "ResourceDictionary", TypeKind::Class, Some(&object));
    ts.define_constructor(&resources, &[]);
    ts.define_method(&resources, "Add", &void, &[string.clone(), object.clone()], false);

    let root = ts.define_type("App", "App", "Root", TypeKind::Class, Some(&object));
    ts.define_constructor(&root, &[]);
    ts.add_auto_property(&root, "Items", &items, true, false);
    ts.add_auto_property(&root, "Resources", &resources, true, false);
    ts.add_auto_property(&root, "Title", &string, true, true);
    ts.add_auto_property(&root, "Count", &int32, true, true);

    let mut config = CompilerConfig::new();
    config.map_namespace(TEST_NS, "App", Some("App"));
    config.map_namespace("clr-test://system", "System", Some("System"));
    World { ts, config, root, item }
}

fn compile(world: &World, source: &str) -> Document {
    compile_document(source, "doc.xaml", &world.config, &world.ts).unwrap()
}

fn collect_assignments(node: &Node, out: &mut Vec<crate::ast::AssignmentNode>) {
    match node {
        Node::Assignment(a) => {
            out.push(a.clone());
            for argument in &a.arguments {
                collect_assignments(argument, out);
            }
        }
        Node::MarkupExtension(m) => collect_assignments(&m.value, out),
        Node::DeferredContent(d) => collect_assignments(&d.value, out),
        Node::ValueWithManipulations(v) => {
            collect_assignments(&v.value, out);
            collect_assignments(&v.manipulation, out);
        }
        Node::ObjectInitialization(i) => collect_assignments(&i.manipulation, out),
        Node::ManipulationGroup(g) => {
            for child in &g.children {
                collect_assignments(child, out);
            }
        }
        Node::LocalManipulation(l) => collect_assignments(&l.manipulation, out),
        Node::LocalValue(l) => collect_assignments(&l.value, out),
        _ => {}
    }
}

fn assignments(document: &Document) -> Vec<crate::ast::AssignmentNode> {
    let mut out = Vec::new();
    collect_assignments(&document.root, &mut out);
    out
}

#[test]
fn collection_property_children_go_through_the_adder() {
    let w = world();
    let doc = compile(
        &w,
        &format!(
            r#"<Root xmlns="{TEST_NS}"><Root.Items><Item/><Item/></Root.Items></Root>"#
        ),
    );

    let Node::ValueWithManipulations(v) = &doc.root else {
        panic!("root should be a construction plan, got {}", doc.root.describe());
    };
    let Node::NewObject(n) = v.value.as_ref() else { panic!() };
    assert_eq!(n.ty, w.root);

    let found = assignments(&doc);
    assert_eq!(found.len(), 2);
    for a in &found {
        assert_eq!(a.property.name(), "Items");
        assert!(matches!(a.setters[0].kind, SetterKind::Adder { .. }));
        let Node::NewObject(arg) = a.arguments.last().unwrap() else { panic!() };
        assert_eq!(arg.ty, w.item);
    }
}

#[test]
fn typed_attributes_strengthen_text() {
    let w = world();
    let doc = compile(
        &w,
        &format!(r#"<Root xmlns="{TEST_NS}" Title="hello" Count="42"/>"#),
    );
    let found = assignments(&doc);
    assert_eq!(found.len(), 2);
    let int32 = w.ts.find_type("System.Int32").unwrap();
    for a in &found {
        let Node::Text(t) = a.arguments.last().unwrap() else { panic!() };
        match a.property.name() {
            "Title" => {
                assert_eq!(t.text, "hello");
                // Direct string match: the text stays untyped.
                assert!(t.ty.is_none());
            }
            "Count" => {
                assert_eq!(t.text, "42");
                assert_eq!(t.ty.as_ref(), Some(&int32));
            }
            other => panic!("unexpected assignment to {}", other),
        }
    }
}

#[test]
fn keyed_values_carry_the_key_as_leading_argument() {
    let w = world();
    let doc = compile(
        &w,
        &format!(
            r#"<Root xmlns="{TEST_NS}" xmlns:x="{X_NS}"><Root.Resources><Item x:Key="accent"/></Root.Resources></Root>"#
        ),
    );
    let found = assignments(&doc);
    assert_eq!(found.len(), 1);
    let a = &found[0];
    assert_eq!(a.property.name(), "Resources");
    assert_eq!(a.arguments.len(), 2);
    let Node::Text(key) = &a.arguments[0] else { panic!() };
    assert_eq!(key.text, "accent");
    assert!(matches!(a.setters[0].kind, SetterKind::Adder { .. }));
    assert_eq!(a.setters[0].parameters.len(), 2);
}

#[test]
fn markup_extension_attribute_becomes_a_provide_value_plan() {
    let w = world();
    let object = w.ts.find_type("System.Object").unwrap();
    let string = w.ts.find_type("System.String").unwrap();
    let ext = w
        .ts
        .define_type("App", "App", "StaticExtension", TypeKind::Class, Some(&object));
    w.ts.define_constructor(&ext, &[]);
    w.ts.add_auto_property(&ext, "Member", &string, true, true);
    w.ts.define_method(&ext, "ProvideValue", &object, &[], false);

    let doc = compile(
        &w,
        &format!(r#"<Root xmlns="{TEST_NS}" Title="{{Static Member=Colors.Red}}"/>"#),
    );
    let found = assignments(&doc);
    let title = found.iter().find(|a| a.property.name() == "Title").unwrap();
    let Node::MarkupExtension(m) = title.arguments.last().unwrap() else {
        panic!("expected a markup extension argument");
    };
    assert_eq!(m.provide_value.name(), "ProvideValue");
    // The extension object itself carries its own Member assignment.
    let Node::ValueWithManipulations(inner) = m.value.as_ref() else { panic!() };
    let Node::NewObject(n) = inner.value.as_ref() else { panic!() };
    assert_eq!(n.ty, ext);
    let member = found.iter().find(|a| a.property.name() == "Member").unwrap();
    let Node::Text(t) = member.arguments.last().unwrap() else { panic!() };
    assert_eq!(t.text, "Colors.Red");
}

#[test]
fn value_type_element_collapses_to_typed_text() {
    let w = world();
    let doc = compile(
        &w,
        &format!(
            r#"<Root xmlns="{TEST_NS}" xmlns:sys="clr-test://system"><Root.Count><sys:Int32>42</sys:Int32></Root.Count></Root>"#
        ),
    );
    let found = assignments(&doc);
    assert_eq!(found.len(), 1);
    let int32 = w.ts.find_type("System.Int32").unwrap();
    let Node::Text(t) = found[0].arguments.last().unwrap() else {
        panic!("value-type element should collapse to typed text");
    };
    assert_eq!(t.text, "42");
    assert_eq!(t.ty.as_ref(), Some(&int32));
}

#[test]
fn deferred_property_wraps_its_value() {
    let w = world();
    let item = w.item.clone();
    let template = w.ts.add_auto_property(&w.root, "Template", &item, true, true);
    w.ts.add_property_attribute(&template, &w.config.deferred_content_attribute);

    let doc = compile(
        &w,
        &format!(r#"<Root xmlns="{TEST_NS}"><Root.Template><Item/></Root.Template></Root>"#),
    );
    let found = assignments(&doc);
    let a = found.iter().find(|a| a.property.name() == "Template").unwrap();
    assert!(matches!(a.arguments.last(), Some(Node::DeferredContent(_))));
}

#[test]
fn usable_during_init_values_split_into_local_pairs() {
    let w = world();
    let object = w.ts.find_type("System.Object").unwrap();
    let string = w.ts.find_type("System.String").unwrap();
    let usable = w.ts.define_type("App", "App", "Usable", TypeKind::Class, Some(&object));
    w.ts.define_constructor(&usable, &[]);
    w.ts.add_auto_property(&usable, "Title", &string, true, true);
    w.ts.add_type_attribute(&usable, &w.config.usable_during_init_attribute, vec![]);
    w.ts.add_auto_property(&w.root, "Child", &usable, true, true);

    let doc = compile(
        &w,
        &format!(
            r#"<Root xmlns="{TEST_NS}"><Root.Child><Usable Title="x"/></Root.Child></Root>"#
        ),
    );
    let Node::ValueWithManipulations(v) = &doc.root else { panic!() };
    let Node::ObjectInitialization(init) = v.manipulation.as_ref() else { panic!() };
    let Node::ManipulationGroup(group) = init.manipulation.as_ref() else {
        panic!("expected the split to leave a two-entry group");
    };
    assert_eq!(group.children.len(), 2);
    let Node::Assignment(a) = &group.children[0] else { panic!() };
    let Node::LocalValue(value) = a.arguments.last().unwrap() else {
        panic!("assignment argument should have become a compiler local");
    };
    let Node::LocalManipulation(after) = &group.children[1] else {
        panic!("the value's own manipulations should follow as a local manipulation");
    };
    assert_eq!(value.local_id, after.local_id);
}

#[test]
fn content_property_absorbs_loose_children() {
    let w = world();
    let content = "System.Windows.Markup.ContentPropertyAttribute";
    w.ts.add_type_attribute(&w.root, content, vec!["Items".to_string()]);

    let doc = compile(&w, &format!(r#"<Root xmlns="{TEST_NS}"><Item/></Root>"#));
    let found = assignments(&doc);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].property.name(), "Items");
}

#[test]
fn unknown_type_is_a_strict_error() {
    let w = world();
    let err = compile_document(
        &format!(r#"<Bogus xmlns="{TEST_NS}"/>"#),
        "doc.xaml",
        &w.config,
        &w.ts,
    )
    .unwrap_err();
    assert_eq!(err.code, ERR_TYPE_UNRESOLVED);
}

#[test]
fn incompatible_value_reports_no_setter() {
    let w = world();
    let err = compile_document(
        &format!(r#"<Root xmlns="{TEST_NS}" Count="not-a-number"/>"#),
        "doc.xaml",
        &w.config,
        &w.ts,
    )
    .unwrap_err();
    assert_eq!(err.code, ERR_BIND_NO_SETTER);
}
