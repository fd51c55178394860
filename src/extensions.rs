//! Markup-extension handling.
//!
//! Attribute values of the form `{Name positional, Prop=value}` parse into
//! ordinary object nodes (with the Extension-suffix probe flag set), so the
//! rest of the pipeline treats extension instantiation like any other
//! element. The transformation pass at the end wraps constructed objects
//! that expose `ProvideValue` so emission substitutes the provided value.
//!
//! Escapes inside an attribute value: `\{`, `\}`, `\\`, and single-quoted
//! runs. A value starting with `{}` is an escaped literal and never reaches
//! this parser.

use std::collections::HashMap;

use crate::ast::{
    MarkupExtensionNode, NamePropertyReference, Node, ObjectNode, PropertyValueNode,
    SourceLocation, TextNode, XmlTypeReference,
};
use crate::diagnostics::{CompilerError, ERR_NAMESPACE_UNRESOLVED, ERR_PARSE_EXTENSION};
use crate::transform::{AstTransformer, TransformContext};
use crate::visitor::AncestorInfo;

// ═══════════════════════════════════════════════════════════════════════════════
// BRACE-SYNTAX PARSER
// ═══════════════════════════════════════════════════════════════════════════════

pub fn parse_markup_extension(
    raw: &str,
    aliases: &HashMap<String, String>,
    file: &str,
    location: SourceLocation,
) -> Result<Node, CompilerError> {
    let mut scanner = Scanner {
        bytes: raw.as_bytes(),
        pos: 0,
        aliases,
        file,
        location,
    };
    let node = scanner.parse_extension()?;
    scanner.skip_whitespace();
    if !scanner.at_end() {
        return Err(scanner.error("trailing characters after markup extension"));
    }
    Ok(node)
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    aliases: &'a HashMap<String, String>,
    file: &'a str,
    location: SourceLocation,
}

impl<'a> Scanner<'a> {
    fn error(&self, message: &str) -> CompilerError {
        CompilerError::new(
            ERR_PARSE_EXTENSION,
            &format!("{} (at offset {})", message, self.pos),
            self.file,
            self.location.line,
            self.location.column,
        )
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), CompilerError> {
        if self.bump() == Some(byte) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn parse_extension(&mut self) -> Result<Node, CompilerError> {
        self.skip_whitespace();
        self.expect(b'{')?;
        self.skip_whitespace();
        let name = self.read_identifier()?;
        let type_reference = self.type_reference(&name)?;

        let mut arguments = Vec::new();
        let mut children = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                None => return Err(self.error("unterminated markup extension")),
                Some(b',') => {
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }
            let item = self.parse_item(&type_reference)?;
            match item {
                Item::Positional(node) => {
                    if !children.is_empty() {
                        return Err(
                            self.error("positional argument after a named property")
                        );
                    }
                    arguments.push(node);
                }
                Item::Named(pv) => children.push(Node::PropertyValue(pv)),
            }
        }
        Ok(Node::Object(ObjectNode {
            type_reference: Box::new(Node::XmlType(type_reference)),
            arguments,
            children,
            location: self.location,
        }))
    }

    fn type_reference(&self, spelling: &str) -> Result<XmlTypeReference, CompilerError> {
        let (prefix, name) = match spelling.split_once(':') {
            Some((p, n)) => (p, n),
            None => ("", spelling),
        };
        let uri = self.aliases.get(prefix).ok_or_else(|| {
            CompilerError::new(
                ERR_NAMESPACE_UNRESOLVED,
                &format!("undeclared namespace alias '{}'", prefix),
                self.file,
                self.location.line,
                self.location.column,
            )
        })?;
        Ok(XmlTypeReference {
            xml_namespace: uri.clone(),
            name: name.to_string(),
            generic_arguments: Vec::new(),
            prefer_extension: true,
            location: self.location,
        })
    }

    fn read_identifier(&mut self) -> Result<String, CompilerError> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b) if b.is_ascii_alphanumeric() || b == b'.' || b == b':' || b == b'_'
        ) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected an identifier"));
        }
        String::from_utf8(self.bytes[start..self.pos].to_vec())
            .map_err(|_| self.error("identifier is not valid UTF-8"))
    }

    fn parse_item(
        &mut self,
        extension_type: &XmlTypeReference,
    ) -> Result<Item, CompilerError> {
        // A bare identifier followed by '=' is a named property; anything
        // else is positional.
        let checkpoint = self.pos;
        if let Ok(name) = self.read_identifier() {
            self.skip_whitespace();
            if self.peek() == Some(b'=') {
                self.pos += 1;
                self.skip_whitespace();
                let value = self.parse_value()?;
                let property = NamePropertyReference {
                    declaring_type: Box::new(Node::XmlType(extension_type.clone())),
                    name,
                    target_type: Box::new(Node::XmlType(extension_type.clone())),
                    location: self.location,
                };
                return Ok(Item::Named(PropertyValueNode {
                    property: Box::new(Node::NameProperty(property)),
                    values: vec![value],
                    location: self.location,
                }));
            }
        }
        self.pos = checkpoint;
        Ok(Item::Positional(self.parse_value()?))
    }

    fn parse_value(&mut self) -> Result<Node, CompilerError> {
        self.skip_whitespace();
        match self.peek() {
            Some(b'{') => self.parse_extension(),
            Some(b'\'') => self.parse_quoted(),
            _ => self.parse_bare(),
        }
    }

    fn parse_quoted(&mut self) -> Result<Node, CompilerError> {
        self.expect(b'\'')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated quoted value")),
                Some(b'\'') => break,
                Some(b'\\') => match self.bump() {
                    Some(escaped) => out.push(escaped as char),
                    None => return Err(self.error("dangling escape in quoted value")),
                },
                Some(b) => out.push(b as char),
            }
        }
        Ok(self.text(out))
    }

    fn parse_bare(&mut self) -> Result<Node, CompilerError> {
        let mut out = String::new();
        loop {
            match self.peek() {
                None | Some(b',') | Some(b'}') | Some(b'=') => break,
                Some(b'{') => return Err(self.error("unescaped '{' inside a value")),
                Some(b'\\') => {
                    self.pos += 1;
                    match self.bump() {
                        Some(escaped @ (b'{' | b'}' | b'\\' | b',' | b'\'')) => {
                            out.push(escaped as char)
                        }
                        Some(other) => {
                            out.push('\\');
                            out.push(other as char);
                        }
                        None => return Err(self.error("dangling escape")),
                    }
                }
                Some(b) => {
                    out.push(b as char);
                    self.pos += 1;
                }
            }
        }
        let trimmed = out.trim().to_string();
        if trimmed.is_empty() {
            return Err(self.error("empty value"));
        }
        Ok(self.text(trimmed))
    }

    fn text(&self, text: String) -> Node {
        Node::Text(TextNode {
            text,
            ty: None,
            location: self.location,
        })
    }
}

enum Item {
    Positional(Node),
    Named(PropertyValueNode),
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASS 9: PROVIDE-VALUE WRAPPING
// ═══════════════════════════════════════════════════════════════════════════════

/// Wraps every constructed value whose type exposes `ProvideValue` (taking
/// nothing or one service provider) so emission substitutes the provided
/// value. The ancestor check prevents wrapping the value a wrapper already
/// owns.
pub struct MarkupExtensionTransformer;

impl AstTransformer for MarkupExtensionTransformer {
    fn name(&self) -> &'static str {
        "markup-extensions"
    }

    fn transform(
        &self,
        _ctx: &mut TransformContext<'_>,
        ancestors: &[AncestorInfo],
        node: Node,
    ) -> Result<Node, CompilerError> {
        if !matches!(
            node,
            Node::NewObject(_) | Node::ValueWithManipulations(_)
        ) {
            return Ok(node);
        }
        if matches!(ancestors.last(), Some(a) if a.kind == crate::ast::NodeKind::MarkupExtension)
        {
            return Ok(node);
        }
        let Some(ty) = node.value_type() else {
            return Ok(node);
        };
        let provide_value = ty
            .find_method("ProvideValue", 1)
            .or_else(|| ty.find_method("ProvideValue", 0));
        let Some(provide_value) = provide_value else {
            return Ok(node);
        };
        let location = node.location();
        Ok(Node::MarkupExtension(MarkupExtensionNode {
            value: Box::new(node),
            provide_value,
            location,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NewObjectNode;
    use crate::transform::CompilerConfig;
    use crate::types::{InMemoryTypeSystem, TypeBuilder, TypeKind, TypeSystem, WellKnownTypes};
    use crate::visitor::rewrite_tree;

    fn aliases() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("".to_string(), "test".to_string());
        map.insert("x".to_string(), "http://markup".to_string());
        map
    }

    #[test]
    fn parses_positional_and_named_arguments() {
        let out = parse_markup_extension(
            "{Binding Path, Mode=TwoWay}",
            &aliases(),
            "t.xaml",
            SourceLocation::new(3, 9),
        )
        .unwrap();
        let Node::Object(obj) = out else { panic!() };
        match obj.type_reference.as_ref() {
            Node::XmlType(r) => {
                assert_eq!(r.name, "Binding");
                assert!(r.prefer_extension);
                assert_eq!(r.xml_namespace, "test");
            }
            other => panic!("unexpected {:?}", other.kind()),
        }
        assert_eq!(obj.arguments.len(), 1);
        assert_eq!(obj.children.len(), 1);
        match &obj.children[0] {
            Node::PropertyValue(pv) => match pv.property.as_ref() {
                Node::NameProperty(p) => assert_eq!(p.name, "Mode"),
                other => panic!("unexpected {:?}", other.kind()),
            },
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn parses_nested_extensions_and_quotes() {
        let out = parse_markup_extension(
            "{Binding Source={x:Static local.Defaults}, Path='a, b\\'c'}",
            &aliases(),
            "t.xaml",
            SourceLocation::default(),
        )
        .unwrap();
        let Node::Object(obj) = out else { panic!() };
        assert_eq!(obj.children.len(), 2);
        match &obj.children[0] {
            Node::PropertyValue(pv) => match &pv.values[0] {
                Node::Object(inner) => match inner.type_reference.as_ref() {
                    Node::XmlType(r) => {
                        assert_eq!(r.name, "Static");
                        assert_eq!(r.xml_namespace, "http://markup");
                    }
                    other => panic!("unexpected {:?}", other.kind()),
                },
                other => panic!("unexpected {:?}", other.kind()),
            },
            other => panic!("unexpected {:?}", other.kind()),
        }
        match &obj.children[1] {
            Node::PropertyValue(pv) => match &pv.values[0] {
                Node::Text(t) => assert_eq!(t.text, "a, b'c"),
                other => panic!("unexpected {:?}", other.kind()),
            },
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn unbalanced_extension_is_rejected() {
        let err = parse_markup_extension(
            "{Binding Path",
            &aliases(),
            "t.xaml",
            SourceLocation::default(),
        )
        .unwrap_err();
        assert_eq!(err.code, ERR_PARSE_EXTENSION);
    }

    #[test]
    fn provide_value_objects_are_wrapped_once() {
        let ts = InMemoryTypeSystem::with_core_types();
        let object = ts.find_type("System.Object").unwrap();
        let ext = ts.define_type("App", "App", "StaticExtension", TypeKind::Class, Some(&object));
        let ctor = ts.define_constructor(&ext, &[]);
        ts.define_method(&ext, "ProvideValue", &object, &[], false);
        let wk = WellKnownTypes::resolve(&ts).unwrap();
        let config = CompilerConfig::new();
        let empty = HashMap::new();
        let mut ctx = TransformContext::new(&config, &ts, &wk, &empty, "t.xaml");

        let tree = Node::NewObject(NewObjectNode {
            ty: ext,
            constructor: ctor,
            arguments: vec![],
            location: SourceLocation::default(),
        });
        let mut run_pass = |node: Node| -> Node {
            struct A<'c, 'a> {
                ctx: &'c mut TransformContext<'a>,
            }
            impl crate::visitor::NodeRewriter for A<'_, '_> {
                fn rewrite(
                    &mut self,
                    ancestors: &[AncestorInfo],
                    node: Node,
                ) -> Result<Node, CompilerError> {
                    MarkupExtensionTransformer.transform(self.ctx, ancestors, node)
                }
            }
            rewrite_tree(node, &mut A { ctx: &mut ctx }).unwrap()
        };
        let once = run_pass(tree);
        let Node::MarkupExtension(wrapped) = &once else { panic!() };
        assert!(matches!(wrapped.value.as_ref(), Node::NewObject(_)));

        // Running the pass again must not wrap a second time.
        let twice = run_pass(once);
        let Node::MarkupExtension(wrapped) = &twice else { panic!() };
        assert!(matches!(wrapped.value.as_ref(), Node::NewObject(_)));
    }
}
