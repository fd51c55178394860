//! Abstract target-machine model.
//!
//! The emission context asks an abstract `CodeEmitter` to emit
//! CLR-flavored instructions; concrete loadable-code backends live outside
//! this crate. `RecordingEmitter` is the in-memory backend: it keeps the
//! instruction stream for inspection, verification, and attachment to
//! builder-defined method bodies.

use std::collections::HashMap;

use crate::types::{XamlConstructor, XamlField, XamlMethod, XamlType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Local(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Nop,
    Dup,
    Pop,
    Ldnull,
    Ret,
    Throw,
    Add,
    Sub,
    LdcI4(i32),
    LdcR8(f64),
    Ldstr(String),
    Ldarg(u16),
    Ldloc(Local),
    Stloc(Local),
    Ldloca(Local),
    Initobj(XamlType),
    Newobj(XamlConstructor),
    Call(XamlMethod),
    Callvirt(XamlMethod),
    Castclass(XamlType),
    Box(XamlType),
    UnboxAny(XamlType),
    Isinst(XamlType),
    Ldfld(XamlField),
    Stfld(XamlField),
    Br(Label),
    Brtrue(Label),
    Brfalse(Label),
    /// Marks a branch target at the current position. Zero stack effect.
    Mark(Label),
    /// `ldtoken` + `GetTypeFromHandle`, collapsed: pushes a runtime type.
    LdType(XamlType),
    /// Pushes a factory closure over a generated method (deferred content).
    LdFactory(XamlMethod),
}

pub trait CodeEmitter {
    fn emit(&mut self, instruction: Instruction);
    fn define_local(&mut self, ty: &XamlType) -> Local;
    fn define_label(&mut self) -> Label;
    fn mark_label(&mut self, label: Label);
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDING BACKEND
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct RecordingEmitter {
    pub instructions: Vec<Instruction>,
    locals: Vec<XamlType>,
    next_label: u32,
    label_positions: HashMap<Label, usize>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locals(&self) -> &[XamlType] {
        &self.locals
    }

    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.label_positions.get(&label).copied()
    }

    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions
    }
}

impl CodeEmitter for RecordingEmitter {
    fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    fn define_local(&mut self, ty: &XamlType) -> Local {
        self.locals.push(ty.clone());
        Local(self.locals.len() as u32 - 1)
    }

    fn define_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    fn mark_label(&mut self, label: Label) {
        self.label_positions
            .insert(label, self.instructions.len());
        self.instructions.push(Instruction::Mark(label));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InMemoryTypeSystem, TypeSystem};

    #[test]
    fn recording_emitter_keeps_stream_and_locals() {
        let ts = InMemoryTypeSystem::with_core_types();
        let string = ts.find_type("System.String").unwrap();
        let mut e = RecordingEmitter::new();
        let local = e.define_local(&string);
        e.emit(Instruction::Ldstr("hi".to_string()));
        e.emit(Instruction::Stloc(local));
        let label = e.define_label();
        e.mark_label(label);
        e.emit(Instruction::Ret);

        assert_eq!(e.locals().len(), 1);
        assert_eq!(e.label_position(label), Some(2));
        assert_eq!(e.instructions.len(), 4);
    }
}
