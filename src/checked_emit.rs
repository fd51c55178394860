//! Stack-balance verification for emitted code.
//!
//! `CheckedEmitter` forwards every instruction to an inner emitter while
//! recording the stream. `finish` then walks the recording with a
//! fixed-point worklist: every reachable position gets exactly one stack
//! depth, branches fork the walk, and terminators must leave the depth the
//! caller declared. Any disagreement is a compiler defect, reported with
//! the internal stack-balance code rather than a markup error.

use std::collections::HashMap;

use crate::ast::SourceLocation;
use crate::diagnostics::{CompilerError, ERR_STACK_BALANCE};
use crate::il::{CodeEmitter, Instruction, Label, Local};
use crate::types::XamlType;

pub struct CheckedEmitter<'a> {
    inner: &'a mut dyn CodeEmitter,
    instructions: Vec<Instruction>,
    start_depth: usize,
    /// Depth required when control falls off the end of the stream.
    expected_final: usize,
    /// Whether `Ret` pops a return value before leaving.
    returns_value: bool,
    file: String,
    location: SourceLocation,
}

impl<'a> CheckedEmitter<'a> {
    pub fn new(
        inner: &'a mut dyn CodeEmitter,
        start_depth: usize,
        expected_final: usize,
        returns_value: bool,
        file: &str,
        location: SourceLocation,
    ) -> Self {
        CheckedEmitter {
            inner,
            instructions: Vec::new(),
            start_depth,
            expected_final,
            returns_value,
            file: file.to_string(),
            location,
        }
    }

    fn defect(&self, message: &str) -> CompilerError {
        CompilerError::new(
            ERR_STACK_BALANCE,
            message,
            &self.file,
            self.location.line,
            self.location.column,
        )
    }

    /// Verify the recorded stream. Consumes the checker; the instructions
    /// have already reached the inner emitter.
    pub fn finish(self) -> Result<(), CompilerError> {
        let mut label_positions: HashMap<Label, usize> = HashMap::new();
        for (position, instruction) in self.instructions.iter().enumerate() {
            if let Instruction::Mark(label) = instruction {
                label_positions.insert(*label, position);
            }
        }

        let mut seen: HashMap<usize, usize> = HashMap::new();
        let mut worklist: Vec<(usize, usize)> = vec![(0, self.start_depth)];
        while let Some((position, depth)) = worklist.pop() {
            if position >= self.instructions.len() {
                if depth != self.expected_final {
                    return Err(self.defect(&format!(
                        "stack depth {} at end of stream, expected {}",
                        depth, self.expected_final
                    )));
                }
                continue;
            }
            match seen.get(&position) {
                Some(known) if *known == depth => continue,
                Some(known) => {
                    return Err(self.defect(&format!(
                        "position {} reached at depths {} and {}",
                        position, known, depth
                    )))
                }
                None => {
                    seen.insert(position, depth);
                }
            }

            let instruction = &self.instructions[position];
            let (pops, pushes) = stack_effect(instruction);
            if depth < pops {
                return Err(self.defect(&format!(
                    "stack underflow at position {}: {:?} pops {} with depth {}",
                    position, instruction, pops, depth
                )));
            }
            let next = depth - pops + pushes;

            match instruction {
                Instruction::Ret => {
                    let after = if self.returns_value {
                        if next == 0 {
                            return Err(self.defect("return with no value on the stack"));
                        }
                        next - 1
                    } else {
                        next
                    };
                    if after != 0 {
                        return Err(self.defect(&format!(
                            "return leaves {} extra value(s) on the stack",
                            after
                        )));
                    }
                }
                Instruction::Throw => {}
                Instruction::Br(label) => {
                    let target = label_positions.get(label).ok_or_else(|| {
                        self.defect(&format!("branch to unmarked label {:?}", label))
                    })?;
                    worklist.push((*target, next));
                }
                Instruction::Brtrue(label) | Instruction::Brfalse(label) => {
                    let target = label_positions.get(label).ok_or_else(|| {
                        self.defect(&format!("branch to unmarked label {:?}", label))
                    })?;
                    worklist.push((*target, next));
                    worklist.push((position + 1, next));
                }
                _ => worklist.push((position + 1, next)),
            }
        }
        Ok(())
    }
}

impl CodeEmitter for CheckedEmitter<'_> {
    fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction.clone());
        self.inner.emit(instruction);
    }

    fn define_local(&mut self, ty: &XamlType) -> Local {
        self.inner.define_local(ty)
    }

    fn define_label(&mut self) -> Label {
        self.inner.define_label()
    }

    fn mark_label(&mut self, label: Label) {
        self.instructions.push(Instruction::Mark(label));
        self.inner.mark_label(label);
    }
}

/// `(pops, pushes)` for one instruction.
fn stack_effect(instruction: &Instruction) -> (usize, usize) {
    use Instruction::*;
    match instruction {
        Nop | Mark(_) => (0, 0),
        Dup => (1, 2),
        Pop | Stloc(_) | Initobj(_) | Throw => (1, 0),
        Ldnull | LdcI4(_) | LdcR8(_) | Ldstr(_) | Ldarg(_) | Ldloc(_) | Ldloca(_)
        | LdType(_) | LdFactory(_) => (0, 1),
        Add | Sub => (2, 1),
        Castclass(_) | Box(_) | UnboxAny(_) | Isinst(_) => (1, 1),
        Ldfld(field) => {
            if field.is_static() {
                (0, 1)
            } else {
                (1, 1)
            }
        }
        Stfld(field) => {
            if field.is_static() {
                (1, 0)
            } else {
                (2, 0)
            }
        }
        Newobj(ctor) => (ctor.parameters().len(), 1),
        Call(method) | Callvirt(method) => {
            let mut pops = method.parameters().len();
            if !method.is_static() {
                pops += 1;
            }
            (pops, if method.returns_void() { 0 } else { 1 })
        }
        // Ret's value pop depends on the signature and is handled by the
        // walk itself.
        Ret => (0, 0),
        Br(_) | Brtrue(_) | Brfalse(_) => match instruction {
            Br(_) => (0, 0),
            _ => (1, 0),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::RecordingEmitter;
    use crate::types::{InMemoryTypeSystem, TypeSystem};

    fn checked<'a>(
        inner: &'a mut RecordingEmitter,
        expected_final: usize,
    ) -> CheckedEmitter<'a> {
        CheckedEmitter::new(inner, 0, expected_final, false, "t.xaml", SourceLocation::default())
    }

    #[test]
    fn balanced_fragment_passes() {
        let ts = InMemoryTypeSystem::with_core_types();
        let string = ts.find_type("System.String").unwrap();
        let mut inner = RecordingEmitter::new();
        let mut e = checked(&mut inner, 1);
        let local = e.define_local(&string);
        e.emit(Instruction::Ldstr("v".to_string()));
        e.emit(Instruction::Dup);
        e.emit(Instruction::Stloc(local));
        e.finish().unwrap();
        assert_eq!(inner.instructions.len(), 3);
    }

    #[test]
    fn underflow_is_reported() {
        let mut inner = RecordingEmitter::new();
        let mut e = checked(&mut inner, 0);
        e.emit(Instruction::Pop);
        let err = e.finish().unwrap_err();
        assert_eq!(err.code, ERR_STACK_BALANCE);
        assert!(err.is_internal());
    }

    #[test]
    fn mismatched_branch_depths_are_reported() {
        let mut inner = RecordingEmitter::new();
        let mut e = checked(&mut inner, 1);
        let join = e.define_label();
        let alt = e.define_label();
        e.emit(Instruction::LdcI4(1));
        e.emit(Instruction::Brtrue(alt));
        e.emit(Instruction::Ldnull);
        e.emit(Instruction::Br(join));
        e.mark_label(alt);
        e.emit(Instruction::Ldnull);
        e.emit(Instruction::Ldnull);
        e.mark_label(join);
        let err = e.finish().unwrap_err();
        assert_eq!(err.code, ERR_STACK_BALANCE);
    }

    #[test]
    fn loops_reach_a_fixed_point() {
        let mut inner = RecordingEmitter::new();
        let mut e = checked(&mut inner, 0);
        let top = e.define_label();
        e.mark_label(top);
        e.emit(Instruction::LdcI4(0));
        e.emit(Instruction::Brtrue(top));
        e.finish().unwrap();
    }

    #[test]
    fn return_depth_is_checked() {
        let mut inner = RecordingEmitter::new();
        let mut e = CheckedEmitter::new(
            &mut inner,
            0,
            0,
            true,
            "t.xaml",
            SourceLocation::default(),
        );
        e.emit(Instruction::Ldnull);
        e.emit(Instruction::Ret);
        e.finish().unwrap();

        let mut inner = RecordingEmitter::new();
        let mut e = CheckedEmitter::new(
            &mut inner,
            0,
            0,
            true,
            "t.xaml",
            SourceLocation::default(),
        );
        e.emit(Instruction::Ret);
        let err = e.finish().unwrap_err();
        assert_eq!(err.code, ERR_STACK_BALANCE);
    }
}
