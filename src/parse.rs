//! XML front end.
//!
//! Parses markup source into the initial loosely-typed AST: object nodes
//! with XML type references, property-value blocks for dotted elements and
//! attributes, directive nodes for markup-namespace attributes, and text.
//! Attribute values in brace syntax hand off to the markup-extension
//! parser.
//!
//! Structural rules enforced here:
//! - `xmlns` aliases are declared on the root element only.
//! - Property elements (`<Owner.Name>`) appear directly inside an object
//!   element and carry no attributes.
//! - Whitespace-only text between elements is dropped; other text is
//!   trimmed and kept.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::ast::{
    DirectiveNode, Document, NamePropertyReference, Node, ObjectNode, PropertyValueNode,
    SourceLocation, TextNode, XmlTypeReference,
};
use crate::diagnostics::{
    CompilerError, ERR_NAMESPACE_UNRESOLVED, ERR_PARSE_MALFORMED,
};
use crate::extensions::parse_markup_extension;
use crate::transform::{CompilerConfig, DIRECTIVE_TYPE_ARGUMENTS};

pub fn parse_document(
    source: &str,
    file: &str,
    config: &CompilerConfig,
) -> Result<Document, CompilerError> {
    let mut parser = Parser {
        file,
        config,
        aliases: HashMap::new(),
        stack: Vec::new(),
        root: None,
    };
    let mut reader = Reader::from_str(source);
    loop {
        let offset = reader.buffer_position();
        let location = line_col(source, offset);
        match reader.read_event() {
            Err(e) => {
                return Err(CompilerError::new(
                    ERR_PARSE_MALFORMED,
                    &format!("malformed XML: {}", e),
                    file,
                    location.line,
                    location.column,
                ))
            }
            Ok(Event::Start(e)) => parser.open(&e, location, false)?,
            Ok(Event::Empty(e)) => parser.open(&e, location, true)?,
            Ok(Event::End(_)) => parser.close(location)?,
            Ok(Event::Text(t)) => {
                let content = match t.unescape() {
                    Ok(c) => c.into_owned(),
                    Err(e) if config.options.legacy_entity_expansion => {
                        tracing::debug!(error = %e, "tolerating unexpandable entity");
                        String::from_utf8_lossy(t.as_ref()).into_owned()
                    }
                    Err(e) => {
                        return Err(CompilerError::new(
                            ERR_PARSE_MALFORMED,
                            &format!("invalid text content: {}", e),
                            file,
                            location.line,
                            location.column,
                        ))
                    }
                };
                parser.text(&content, location)?;
            }
            Ok(Event::CData(t)) => {
                let content = String::from_utf8_lossy(t.as_ref()).into_owned();
                parser.text(&content, location)?;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
        }
    }
    if !parser.stack.is_empty() {
        return Err(parser.error(
            "unexpected end of input inside an element",
            SourceLocation::default(),
        ));
    }
    let root = parser
        .root
        .take()
        .ok_or_else(|| parser.error("document has no root element", SourceLocation::default()))?;
    Ok(Document {
        root,
        namespace_aliases: parser.aliases,
        file: file.to_string(),
    })
}

fn line_col(source: &str, offset: usize) -> SourceLocation {
    let offset = offset.min(source.len());
    let mut line = 1u32;
    let mut column = 1u32;
    for b in source.as_bytes()[..offset].iter() {
        if *b == b'\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    SourceLocation::new(line, column)
}

enum Frame {
    Object(ObjectNode),
    Property(PropertyValueNode),
}

struct Parser<'a> {
    file: &'a str,
    config: &'a CompilerConfig,
    aliases: HashMap<String, String>,
    stack: Vec<Frame>,
    root: Option<Node>,
}

impl Parser<'_> {
    fn error(&self, message: &str, location: SourceLocation) -> CompilerError {
        CompilerError::new(
            ERR_PARSE_MALFORMED,
            message,
            self.file,
            location.line,
            location.column,
        )
    }

    fn utf8(&self, bytes: &[u8], location: SourceLocation) -> Result<String, CompilerError> {
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| self.error("name is not valid UTF-8", location))
    }

    fn resolve_alias(
        &self,
        prefix: &str,
        location: SourceLocation,
    ) -> Result<String, CompilerError> {
        self.aliases.get(prefix).cloned().ok_or_else(|| {
            CompilerError::new(
                ERR_NAMESPACE_UNRESOLVED,
                &format!("undeclared namespace alias '{}'", prefix),
                self.file,
                location.line,
                location.column,
            )
        })
    }

    fn is_markup_uri(&self, uri: &str) -> bool {
        self.config.markup_namespaces.iter().any(|ns| ns == uri)
    }

    fn open(
        &mut self,
        element: &BytesStart<'_>,
        location: SourceLocation,
        self_closing: bool,
    ) -> Result<(), CompilerError> {
        let qname = element.name();
        let prefix = match qname.prefix() {
            Some(p) => self.utf8(p.as_ref(), location)?,
            None => String::new(),
        };
        let local = self.utf8(qname.local_name().as_ref(), location)?;

        let at_root = self.stack.is_empty();
        if at_root {
            self.collect_root_aliases(element, location)?;
        }

        if let Some((owner, property)) = local.split_once('.') {
            return self.open_property_element(
                element,
                &prefix,
                owner,
                property,
                location,
                self_closing,
            );
        }

        let uri = self.resolve_alias(&prefix, location)?;
        let mut obj = ObjectNode {
            type_reference: Box::new(Node::XmlType(XmlTypeReference {
                xml_namespace: uri,
                name: local,
                generic_arguments: Vec::new(),
                prefer_extension: false,
                location,
            })),
            arguments: Vec::new(),
            children: Vec::new(),
            location,
        };
        self.apply_attributes(element, &mut obj, at_root, location)?;

        if self_closing {
            self.attach(Node::Object(obj), location)
        } else {
            self.stack.push(Frame::Object(obj));
            Ok(())
        }
    }

    fn open_property_element(
        &mut self,
        element: &BytesStart<'_>,
        prefix: &str,
        owner: &str,
        property: &str,
        location: SourceLocation,
        self_closing: bool,
    ) -> Result<(), CompilerError> {
        let target_type = match self.stack.last() {
            Some(Frame::Object(o)) => o.type_reference.clone(),
            _ => {
                return Err(self.error(
                    "property element must appear directly inside an object element",
                    location,
                ))
            }
        };
        if element.attributes().next().is_some() {
            return Err(self.error("property elements do not take attributes", location));
        }
        let uri = self.resolve_alias(prefix, location)?;
        let node = PropertyValueNode {
            property: Box::new(Node::NameProperty(NamePropertyReference {
                declaring_type: Box::new(Node::XmlType(XmlTypeReference {
                    xml_namespace: uri,
                    name: owner.to_string(),
                    generic_arguments: Vec::new(),
                    prefer_extension: false,
                    location,
                })),
                name: property.to_string(),
                target_type,
                location,
            })),
            values: Vec::new(),
            location,
        };
        if self_closing {
            self.attach(Node::PropertyValue(node), location)
        } else {
            self.stack.push(Frame::Property(node));
            Ok(())
        }
    }

    fn collect_root_aliases(
        &mut self,
        element: &BytesStart<'_>,
        location: SourceLocation,
    ) -> Result<(), CompilerError> {
        for attr in element.attributes() {
            let attr =
                attr.map_err(|e| self.error(&format!("malformed attribute: {}", e), location))?;
            let key = attr.key;
            let key_prefix = key
                .prefix()
                .map(|p| self.utf8(p.as_ref(), location))
                .transpose()?
                .unwrap_or_default();
            let key_local = self.utf8(key.local_name().as_ref(), location)?;
            let alias = if key_prefix.is_empty() && key_local == "xmlns" {
                Some(String::new())
            } else if key_prefix == "xmlns" {
                Some(key_local)
            } else {
                None
            };
            if let Some(alias) = alias {
                let value = self.attribute_value(&attr, location)?;
                self.aliases.insert(alias, value);
            }
        }
        Ok(())
    }

    fn apply_attributes(
        &mut self,
        element: &BytesStart<'_>,
        obj: &mut ObjectNode,
        at_root: bool,
        location: SourceLocation,
    ) -> Result<(), CompilerError> {
        for attr in element.attributes() {
            let attr =
                attr.map_err(|e| self.error(&format!("malformed attribute: {}", e), location))?;
            let key = attr.key;
            let key_prefix = key
                .prefix()
                .map(|p| self.utf8(p.as_ref(), location))
                .transpose()?
                .unwrap_or_default();
            let key_local = self.utf8(key.local_name().as_ref(), location)?;

            let is_xmlns =
                key_prefix == "xmlns" || (key_prefix.is_empty() && key_local == "xmlns");
            if is_xmlns {
                if at_root {
                    continue;
                }
                return Err(self.error(
                    "xmlns declarations are only allowed on the root element",
                    location,
                ));
            }

            let raw = self.attribute_value(&attr, location)?;
            if !key_prefix.is_empty() {
                let uri = self.resolve_alias(&key_prefix, location)?;
                if self.is_markup_uri(&uri) {
                    if key_local == DIRECTIVE_TYPE_ARGUMENTS {
                        self.apply_type_arguments(obj, &raw, location)?;
                    } else {
                        obj.children.push(Node::Directive(DirectiveNode {
                            namespace: uri,
                            name: key_local,
                            values: vec![self.attribute_node(&raw, location)?],
                            location,
                        }));
                    }
                    continue;
                }
            }

            let value = self.attribute_node(&raw, location)?;
            let (declaring, name) = match key_local.split_once('.') {
                Some((owner, name)) => {
                    let owner_prefix = if key_prefix.is_empty() {
                        self.element_prefix(obj)
                    } else {
                        key_prefix.clone()
                    };
                    let uri = self.resolve_alias(&owner_prefix, location)?;
                    (
                        Box::new(Node::XmlType(XmlTypeReference {
                            xml_namespace: uri,
                            name: owner.to_string(),
                            generic_arguments: Vec::new(),
                            prefer_extension: false,
                            location,
                        })),
                        name.to_string(),
                    )
                }
                None => (obj.type_reference.clone(), key_local),
            };
            obj.children.push(Node::PropertyValue(PropertyValueNode {
                property: Box::new(Node::NameProperty(NamePropertyReference {
                    declaring_type: declaring,
                    name,
                    target_type: obj.type_reference.clone(),
                    location,
                })),
                values: vec![value],
                location,
            }));
        }
        Ok(())
    }

    /// Prefix the element itself was spelled with, recovered from its own
    /// namespace URI. Used for unprefixed dotted attributes.
    fn element_prefix(&self, obj: &ObjectNode) -> String {
        let uri = match obj.type_reference.as_ref() {
            Node::XmlType(r) => r.xml_namespace.clone(),
            _ => return String::new(),
        };
        self.aliases
            .iter()
            .find(|(_, v)| **v == uri)
            .map(|(k, _)| k.clone())
            .unwrap_or_default()
    }

    fn apply_type_arguments(
        &self,
        obj: &mut ObjectNode,
        raw: &str,
        location: SourceLocation,
    ) -> Result<(), CompilerError> {
        let mut arguments = Vec::new();
        for spelling in raw.split(',') {
            let spelling = spelling.trim();
            if spelling.is_empty() {
                return Err(self.error("empty type argument", location));
            }
            let (prefix, name) = match spelling.split_once(':') {
                Some((p, n)) => (p, n),
                None => ("", spelling),
            };
            let uri = self.resolve_alias(prefix, location)?;
            arguments.push(Node::XmlType(XmlTypeReference {
                xml_namespace: uri,
                name: name.to_string(),
                generic_arguments: Vec::new(),
                prefer_extension: false,
                location,
            }));
        }
        match obj.type_reference.as_mut() {
            Node::XmlType(r) => {
                r.generic_arguments = arguments;
                Ok(())
            }
            _ => Err(self.error("type arguments on an unexpected element", location)),
        }
    }

    fn attribute_value(
        &self,
        attr: &quick_xml::events::attributes::Attribute<'_>,
        location: SourceLocation,
    ) -> Result<String, CompilerError> {
        match attr.unescape_value() {
            Ok(v) => Ok(v.into_owned()),
            Err(e) if self.config.options.legacy_entity_expansion => {
                tracing::debug!(error = %e, "tolerating unexpandable entity in attribute");
                Ok(String::from_utf8_lossy(&attr.value).into_owned())
            }
            Err(e) => Err(self.error(&format!("invalid attribute value: {}", e), location)),
        }
    }

    /// Attribute text becomes a markup-extension subtree when it uses brace
    /// syntax; a `{}` prefix escapes a literal brace.
    fn attribute_node(
        &self,
        raw: &str,
        location: SourceLocation,
    ) -> Result<Node, CompilerError> {
        if let Some(literal) = raw.strip_prefix("{}") {
            return Ok(Node::Text(TextNode {
                text: literal.to_string(),
                ty: None,
                location,
            }));
        }
        if raw.starts_with('{') {
            return parse_markup_extension(raw, &self.aliases, self.file, location);
        }
        Ok(Node::Text(TextNode {
            text: raw.to_string(),
            ty: None,
            location,
        }))
    }

    fn text(&mut self, content: &str, location: SourceLocation) -> Result<(), CompilerError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let node = Node::Text(TextNode {
            text: trimmed.to_string(),
            ty: None,
            location,
        });
        match self.stack.last_mut() {
            Some(Frame::Object(o)) => o.children.push(node),
            Some(Frame::Property(p)) => p.values.push(node),
            None => return Err(self.error("text outside the root element", location)),
        }
        Ok(())
    }

    fn close(&mut self, location: SourceLocation) -> Result<(), CompilerError> {
        match self.stack.pop() {
            Some(Frame::Object(o)) => self.attach(Node::Object(o), location),
            Some(Frame::Property(p)) => self.attach(Node::PropertyValue(p), location),
            None => Err(self.error("unexpected closing tag", location)),
        }
    }

    fn attach(&mut self, node: Node, location: SourceLocation) -> Result<(), CompilerError> {
        match self.stack.last_mut() {
            Some(Frame::Object(o)) => o.children.push(node),
            Some(Frame::Property(p)) => p.values.push(node),
            None => {
                if self.root.is_some() {
                    return Err(self.error("more than one root element", location));
                }
                if !matches!(node, Node::Object(_)) {
                    return Err(
                        self.error("the root element must be an object element", location)
                    );
                }
                self.root = Some(node);
            }
        }
        Ok(())
    }
}
