//! Diagnostics for the markup compiler.
//!
//! Every user-facing failure carries an error code, the offending source
//! location, and the invariant the markup violated. Internal consistency
//! failures use dedicated codes so compiler defects are never reported as
//! markup mistakes.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_PARSE_MALFORMED: &str = "X-ERR-PARSE-001";
pub const ERR_PARSE_EXTENSION: &str = "X-ERR-PARSE-002";
pub const ERR_PARSE_DIRECTIVE: &str = "X-ERR-PARSE-003";
pub const ERR_TYPE_UNRESOLVED: &str = "X-ERR-TYPE-001";
pub const ERR_NAMESPACE_UNRESOLVED: &str = "X-ERR-TYPE-002";
pub const ERR_PROPERTY_UNRESOLVED: &str = "X-ERR-PROP-001";
pub const ERR_BIND_NO_SETTER: &str = "X-ERR-BIND-001";
pub const ERR_BIND_AMBIGUOUS: &str = "X-ERR-BIND-002";
pub const ERR_BIND_MULTIPLE: &str = "X-ERR-BIND-003";
pub const ERR_BIND_CONSTRUCTOR: &str = "X-ERR-BIND-004";
pub const ERR_CONVERSION: &str = "X-ERR-CONV-001";
pub const ERR_STRUCT_CONSTRUCTION: &str = "X-ERR-STRUCT-001";
pub const ERR_INTERNAL: &str = "X-ERR-INTERNAL-001";
pub const ERR_STACK_BALANCE: &str = "X-ERR-INTERNAL-002";

// ═══════════════════════════════════════════════════════════════════════════════
// GUARANTEES
// ═══════════════════════════════════════════════════════════════════════════════

fn guarantee_for(code: &str) -> &'static str {
    match code {
        ERR_PARSE_MALFORMED => "Markup is well-formed XML and xmlns aliases are declared on the root element only.",
        ERR_PARSE_EXTENSION => "Markup-extension syntax is balanced and uses only the documented argument forms.",
        ERR_PARSE_DIRECTIVE => "Compiler directives carry exactly the argument shapes they document.",
        ERR_TYPE_UNRESOLVED => "Every type reference resolves to a concrete metadata type before emission.",
        ERR_NAMESPACE_UNRESOLVED => "Every namespace alias maps to a declared xmlns URI.",
        ERR_PROPERTY_UNRESOLVED => "Every property reference resolves to a member or attached-accessor pair before emission.",
        ERR_BIND_NO_SETTER => "Every property value matches at least one setter or adder signature.",
        ERR_BIND_AMBIGUOUS => "Non-final setter arguments convert unambiguously across all surviving candidates.",
        ERR_BIND_MULTIPLE => "Repeated assignment to one property uses only setters that allow multiple assignment.",
        ERR_BIND_CONSTRUCTOR => "Explicit constructor arguments match a public constructor by arity with argument-wise conversions.",
        ERR_CONVERSION => "Implicit conversions follow the value/reference decision table; unrelated types never convert.",
        ERR_STRUCT_CONSTRUCTION => "Value types and strings are constructed only from a single text node via a converter.",
        ERR_INTERNAL => "Transformers and emitters uphold their node contracts.",
        ERR_STACK_BALANCE => "Emitted code leaves the evaluation stack balanced on every path.",
        _ => "Unknown invariant.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerError {
    pub code: String,
    pub error_type: String,
    pub message: String,
    pub guarantee: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub context: Option<String>,
    pub hints: Vec<String>,
}

impl CompilerError {
    pub fn new(code: &str, message: &str, file: &str, line: u32, column: u32) -> Self {
        Self::with_details(code, message, file, line, column, None, vec![])
    }

    pub fn with_details(
        code: &str,
        message: &str,
        file: &str,
        line: u32,
        column: u32,
        context: Option<String>,
        hints: Vec<String>,
    ) -> Self {
        let error_type = if code.starts_with("X-ERR-INTERNAL") {
            "COMPILER_DEFECT".to_string()
        } else {
            "MARKUP_ERROR".to_string()
        };
        CompilerError {
            code: code.to_string(),
            error_type,
            message: message.to_string(),
            guarantee: guarantee_for(code).to_string(),
            file: file.to_string(),
            line,
            column,
            context,
            hints,
        }
    }

    /// Internal defects get wrapped with the description of the node the
    /// compiler was working on, so the report points at the compiler, not
    /// at the user's markup.
    pub fn internal(message: &str, node_description: &str, line: u32, column: u32) -> Self {
        Self::with_details(
            ERR_INTERNAL,
            message,
            "",
            line,
            column,
            Some(format!("while processing {}", node_description)),
            vec![],
        )
    }

    pub fn is_internal(&self) -> bool {
        self.error_type == "COMPILER_DEFECT"
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

impl std::fmt::Display for CompilerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({}:{}:{})",
            self.code, self.message, self.file, self.line, self.column
        )
    }
}

impl std::error::Error for CompilerError {}
