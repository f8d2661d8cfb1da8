//! Bind programs and their evaluator.
//!
//! A driver declares which devices it supports with a [`BindProgram`]: an
//! ordered list of directives tested against a device's properties. The
//! evaluator runs the directives from the first one with an explicit
//! instruction pointer and halts at the first directive that fires.
//!
//! | directive            | effect when the condition holds          |
//! |----------------------|------------------------------------------|
//! | `ABORT_IF`           | halt, no match                           |
//! | `MATCH_IF`           | halt, match                              |
//! | `GOTO` / `GOTO_IF`   | jump forward to a `LABEL`                |
//! | `LABEL`              | none, marks a jump target                |
//! | `ABORT_IF_AUTOBIND`  | halt, no match, during automatic binding |
//!
//! Running off the end of the program is a no-match. Jumps may only go
//! forward, which [`BindProgram::new`] checks when the program is loaded, so
//! evaluation always terminates.
//!
//! # Example
//!
//! ```
//! use ddk_io::binding::{BindInst, BindMode, BindProgram, BindResult, Cond};
//! use ddk_io::props::{DeviceProp, PropertyTable, keys};
//!
//! let program = BindProgram::new("acme", "1.0", vec![
//!     BindInst::abort_if(Cond::Ne, keys::BIND_PCI_VID, 0x8086),
//!     BindInst::match_if(Cond::Eq, keys::BIND_PCI_DID, 0x100e),
//! ])?;
//!
//! let props = PropertyTable::new(vec![
//!     DeviceProp::new(keys::BIND_PCI_VID, 0x8086),
//!     DeviceProp::new(keys::BIND_PCI_DID, 0x100e),
//! ]);
//! assert_eq!(program.evaluate(&props, BindMode::Manual).result, BindResult::Match);
//! # Ok::<(), ddk_io::Error>(())
//! ```

use std::collections::HashMap;

use crate::props::{PropertyLookup, keys};

/// Magic bytes at the start of an encoded bind program.
pub const BIND_MAGIC: [u8; 4] = *b"BIND";

/// Size in bytes of one encoded directive.
pub const INST_WIRE_SIZE: usize = 12;

/// Directive opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BindOp {
    AbortIf = 0,
    MatchIf = 1,
    /// `GOTO` is encoded as `GOTO_IF` with [`Cond::Always`].
    GotoIf = 2,
    Label = 5,
    AbortIfAutobind = 6,
}

impl BindOp {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(BindOp::AbortIf),
            1 => Some(BindOp::MatchIf),
            2 => Some(BindOp::GotoIf),
            5 => Some(BindOp::Label),
            6 => Some(BindOp::AbortIfAutobind),
            _ => None,
        }
    }
}

/// Comparison operator applied to `properties[key]` and the directive's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    /// Always true; the key is not consulted.
    Always = 0,
    Eq = 1,
    Ne = 2,
    Gt = 3,
    Lt = 4,
    Ge = 5,
    Le = 6,
    /// `prop & value != 0`
    Mask = 7,
    /// `prop & value == value`
    Bits = 8,
}

impl Cond {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Cond::Always),
            1 => Some(Cond::Eq),
            2 => Some(Cond::Ne),
            3 => Some(Cond::Gt),
            4 => Some(Cond::Lt),
            5 => Some(Cond::Ge),
            6 => Some(Cond::Le),
            7 => Some(Cond::Mask),
            8 => Some(Cond::Bits),
            _ => None,
        }
    }

    fn holds(self, prop: u32, value: u32) -> bool {
        match self {
            Cond::Always => true,
            Cond::Eq => prop == value,
            Cond::Ne => prop != value,
            Cond::Gt => prop > value,
            Cond::Lt => prop < value,
            Cond::Ge => prop >= value,
            Cond::Le => prop <= value,
            Cond::Mask => prop & value != 0,
            Cond::Bits => prop & value == value,
        }
    }
}

/// One bind directive.
///
/// `label` is the jump target of a `GOTO_IF` and the id of a `LABEL`; it is
/// unused by the other opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindInst {
    pub op: BindOp,
    pub cond: Cond,
    pub label: u16,
    pub key: u32,
    pub value: u32,
}

impl BindInst {
    pub const fn abort_if(cond: Cond, key: u32, value: u32) -> Self {
        Self {
            op: BindOp::AbortIf,
            cond,
            label: 0,
            key,
            value,
        }
    }

    pub const fn match_if(cond: Cond, key: u32, value: u32) -> Self {
        Self {
            op: BindOp::MatchIf,
            cond,
            label: 0,
            key,
            value,
        }
    }

    pub const fn goto(label: u16) -> Self {
        Self::goto_if(Cond::Always, 0, 0, label)
    }

    pub const fn goto_if(cond: Cond, key: u32, value: u32, label: u16) -> Self {
        Self {
            op: BindOp::GotoIf,
            cond,
            label,
            key,
            value,
        }
    }

    pub const fn label(label: u16) -> Self {
        Self {
            op: BindOp::Label,
            cond: Cond::Always,
            label,
            key: 0,
            value: 0,
        }
    }

    pub const fn abort_if_autobind() -> Self {
        Self {
            op: BindOp::AbortIfAutobind,
            cond: Cond::Always,
            label: 0,
            key: 0,
            value: 0,
        }
    }

    pub const fn match_always() -> Self {
        Self::match_if(Cond::Always, 0, 0)
    }

    pub const fn abort_always() -> Self {
        Self::abort_if(Cond::Always, 0, 0)
    }
}

/// Why a bind program was rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindProgramError {
    #[error("bad magic")]
    BadMagic,

    #[error("program truncated")]
    Truncated,

    #[error("{0} trailing bytes after the last directive")]
    TrailingData(usize),

    #[error("header string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown opcode {opcode} at directive {index}")]
    UnknownOpcode { index: usize, opcode: u8 },

    #[error("unknown operator {operator} at directive {index}")]
    UnknownOperator { index: usize, operator: u8 },

    #[error("label {label} defined twice (directive {index})")]
    DuplicateLabel { label: u16, index: usize },

    #[error("directive {index} jumps to undefined label {label}")]
    UnresolvedLabel { label: u16, index: usize },

    #[error("directive {from} jumps backward to label {label} at directive {to}")]
    BackwardJump { label: u16, from: usize, to: usize },
}

/// Whether evaluation was triggered by automatic matching or an explicit
/// request to bind a specific driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    Autobind,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindResult {
    Match,
    NoMatch,
}

/// Result of evaluating a program, with the 1-based index of the directive
/// that fired (`None` when evaluation ran off the end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindOutcome {
    pub result: BindResult,
    pub directive: Option<usize>,
}

impl BindOutcome {
    #[inline]
    pub fn is_match(&self) -> bool {
        self.result == BindResult::Match
    }
}

/// A validated bind program.
///
/// Construction resolves every jump to an instruction index, so a
/// `BindProgram` value is always well-formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindProgram {
    vendor: String,
    version: String,
    insts: Vec<BindInst>,
    /// Resolved jump target per directive; only meaningful for `GotoIf`.
    targets: Vec<usize>,
}

impl BindProgram {
    /// Validate and load a program.
    ///
    /// # Errors
    ///
    /// Returns a [`BindProgramError`] for duplicate labels, jumps to labels
    /// that do not exist, and jumps that do not go strictly forward.
    pub fn new(
        vendor: &str,
        version: &str,
        insts: Vec<BindInst>,
    ) -> std::result::Result<Self, BindProgramError> {
        let mut labels = HashMap::new();
        for (index, inst) in insts.iter().enumerate() {
            if inst.op == BindOp::Label && labels.insert(inst.label, index).is_some() {
                return Err(BindProgramError::DuplicateLabel {
                    label: inst.label,
                    index,
                });
            }
        }

        let mut targets = vec![0; insts.len()];
        for (index, inst) in insts.iter().enumerate() {
            if inst.op != BindOp::GotoIf {
                continue;
            }
            let to = *labels
                .get(&inst.label)
                .ok_or(BindProgramError::UnresolvedLabel {
                    label: inst.label,
                    index,
                })?;
            if to <= index {
                return Err(BindProgramError::BackwardJump {
                    label: inst.label,
                    from: index,
                    to,
                });
            }
            targets[index] = to;
        }

        Ok(Self {
            vendor: vendor.to_string(),
            version: version.to_string(),
            insts,
            targets,
        })
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn instructions(&self) -> &[BindInst] {
        &self.insts
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Run the program against a property set.
    ///
    /// Conditions on keys the device does not carry are false. The
    /// [`keys::BIND_AUTOBIND`] key always reads 1 in [`BindMode::Autobind`]
    /// and 0 in [`BindMode::Manual`].
    pub fn evaluate<P: PropertyLookup + ?Sized>(&self, props: &P, mode: BindMode) -> BindOutcome {
        let lookup = |key: u32| {
            if key == keys::BIND_AUTOBIND {
                Some(u32::from(mode == BindMode::Autobind))
            } else {
                props.lookup(key)
            }
        };
        let test = |inst: &BindInst| match inst.cond {
            Cond::Always => true,
            cond => lookup(inst.key).is_some_and(|prop| cond.holds(prop, inst.value)),
        };
        let halt = |result, ip: usize| BindOutcome {
            result,
            directive: Some(ip + 1),
        };

        let mut ip = 0;
        while let Some(inst) = self.insts.get(ip) {
            match inst.op {
                BindOp::AbortIf if test(inst) => return halt(BindResult::NoMatch, ip),
                BindOp::MatchIf if test(inst) => return halt(BindResult::Match, ip),
                BindOp::GotoIf if test(inst) => {
                    ip = self.targets[ip];
                    continue;
                }
                BindOp::AbortIfAutobind if mode == BindMode::Autobind => {
                    return halt(BindResult::NoMatch, ip);
                }
                _ => {}
            }
            ip += 1;
        }

        BindOutcome {
            result: BindResult::NoMatch,
            directive: None,
        }
    }

    /// Decode and validate a program from its binary layout.
    ///
    /// ```text
    /// "BIND" | vendor_len:u32 | vendor | version_len:u32 | version | count:u32
    /// count x { opcode:u8 | operator:u8 | label:u16 | key:u32 | value:u32 }
    /// ```
    ///
    /// All integers are little-endian.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, BindProgramError> {
        let mut r = Reader { bytes, pos: 0 };
        if r.take(4)? != BIND_MAGIC {
            return Err(BindProgramError::BadMagic);
        }
        let vendor = r.string()?;
        let version = r.string()?;
        let count = r.u32()? as usize;

        let body = bytes.len() - r.pos;
        let expected = count
            .checked_mul(INST_WIRE_SIZE)
            .ok_or(BindProgramError::Truncated)?;
        if body < expected {
            return Err(BindProgramError::Truncated);
        }
        if body > expected {
            return Err(BindProgramError::TrailingData(body - expected));
        }

        let mut insts = Vec::with_capacity(count);
        for index in 0..count {
            let rec = r.take(INST_WIRE_SIZE)?;
            let op = BindOp::from_u8(rec[0]).ok_or(BindProgramError::UnknownOpcode {
                index,
                opcode: rec[0],
            })?;
            let cond = Cond::from_u8(rec[1]).ok_or(BindProgramError::UnknownOperator {
                index,
                operator: rec[1],
            })?;
            insts.push(BindInst {
                op,
                cond,
                label: u16::from_le_bytes([rec[2], rec[3]]),
                key: u32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]),
                value: u32::from_le_bytes([rec[8], rec[9], rec[10], rec[11]]),
            });
        }

        Self::new(&vendor, &version, insts)
    }

    /// Encode into the binary layout accepted by [`from_bytes`](Self::from_bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            16 + self.vendor.len() + self.version.len() + self.insts.len() * INST_WIRE_SIZE,
        );
        out.extend_from_slice(&BIND_MAGIC);
        for s in [&self.vendor, &self.version] {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        out.extend_from_slice(&(self.insts.len() as u32).to_le_bytes());
        for inst in &self.insts {
            out.push(inst.op as u8);
            out.push(inst.cond as u8);
            out.extend_from_slice(&inst.label.to_le_bytes());
            out.extend_from_slice(&inst.key.to_le_bytes());
            out.extend_from_slice(&inst.value.to_le_bytes());
        }
        out
    }
}

/// Evaluate `program` against `props`.
pub fn evaluate<P: PropertyLookup + ?Sized>(
    program: &BindProgram,
    props: &P,
    mode: BindMode,
) -> BindResult {
    program.evaluate(props, mode).result
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], BindProgramError> {
        let end = self.pos.checked_add(n).ok_or(BindProgramError::Truncated)?;
        let s = self
            .bytes
            .get(self.pos..end)
            .ok_or(BindProgramError::Truncated)?;
        self.pos = end;
        Ok(s)
    }

    fn u32(&mut self) -> std::result::Result<u32, BindProgramError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> std::result::Result<String, BindProgramError> {
        let len = self.u32()? as usize;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| BindProgramError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{DeviceProp, PropertyTable};

    const PCI: u32 = 4;
    const K_CLASS: u32 = keys::BIND_PCI_CLASS;
    const K_SUBCLASS: u32 = keys::BIND_PCI_SUBCLASS;
    const K_INTERFACE: u32 = keys::BIND_PCI_INTERFACE;

    fn ahci_program() -> BindProgram {
        BindProgram::new(
            "test",
            "0.1",
            vec![
                BindInst::abort_if(Cond::Ne, keys::BIND_PROTOCOL, PCI),
                BindInst::abort_if(Cond::Ne, K_CLASS, 1),
                BindInst::abort_if(Cond::Ne, K_SUBCLASS, 6),
                BindInst::match_if(Cond::Eq, K_INTERFACE, 1),
            ],
        )
        .unwrap()
    }

    fn pci_props(interface: u32) -> PropertyTable {
        PropertyTable::new(vec![
            DeviceProp::new(keys::BIND_PROTOCOL, PCI),
            DeviceProp::new(K_CLASS, 1),
            DeviceProp::new(K_SUBCLASS, 6),
            DeviceProp::new(K_INTERFACE, interface),
        ])
    }

    #[test]
    fn test_fall_through_is_no_match() {
        let outcome = ahci_program().evaluate(&pci_props(2), BindMode::Autobind);
        assert_eq!(outcome.result, BindResult::NoMatch);
        assert_eq!(outcome.directive, None);
    }

    #[test]
    fn test_match_at_fourth_directive() {
        let outcome = ahci_program().evaluate(&pci_props(1), BindMode::Autobind);
        assert_eq!(outcome.result, BindResult::Match);
        assert_eq!(outcome.directive, Some(4));
    }

    #[test]
    fn test_abort_wins_over_later_match() {
        let program = BindProgram::new(
            "test",
            "0.1",
            vec![
                BindInst::abort_if(Cond::Eq, K_CLASS, 1),
                BindInst::match_always(),
            ],
        )
        .unwrap();
        assert_eq!(
            evaluate(&program, &pci_props(1), BindMode::Manual),
            BindResult::NoMatch
        );
    }

    #[test]
    fn test_missing_key_is_false() {
        let program = BindProgram::new(
            "test",
            "0.1",
            vec![
                BindInst::abort_if(Cond::Ne, keys::BIND_USB_VID, 0x1234),
                BindInst::match_if(Cond::Ne, keys::BIND_USB_PID, 0),
                BindInst::match_if(Cond::Always, keys::BIND_USB_PID, 0),
            ],
        )
        .unwrap();
        let outcome = program.evaluate(&PropertyTable::empty(), BindMode::Manual);
        assert_eq!(outcome.result, BindResult::Match);
        assert_eq!(outcome.directive, Some(3));
    }

    #[test]
    fn test_goto_skips_directives() {
        let program = BindProgram::new(
            "test",
            "0.1",
            vec![
                BindInst::goto_if(Cond::Eq, K_CLASS, 1, 7),
                BindInst::abort_always(),
                BindInst::label(7),
                BindInst::match_if(Cond::Bits, K_SUBCLASS, 0x6),
            ],
        )
        .unwrap();
        assert!(program.evaluate(&pci_props(0), BindMode::Manual).is_match());

        let other = PropertyTable::new(vec![DeviceProp::new(K_CLASS, 2)]);
        let outcome = program.evaluate(&other, BindMode::Manual);
        assert_eq!(outcome.result, BindResult::NoMatch);
        assert_eq!(outcome.directive, Some(2));
    }

    #[test]
    fn test_abort_if_autobind() {
        let program = BindProgram::new(
            "test",
            "0.1",
            vec![BindInst::abort_if_autobind(), BindInst::match_always()],
        )
        .unwrap();
        let props = PropertyTable::empty();
        assert!(!program.evaluate(&props, BindMode::Autobind).is_match());
        assert!(program.evaluate(&props, BindMode::Manual).is_match());
    }

    #[test]
    fn test_autobind_key_is_synthetic() {
        let program = BindProgram::new(
            "test",
            "0.1",
            vec![BindInst::match_if(Cond::Eq, keys::BIND_AUTOBIND, 1)],
        )
        .unwrap();
        let props = PropertyTable::new(vec![DeviceProp::new(keys::BIND_AUTOBIND, 0)]);
        assert!(program.evaluate(&props, BindMode::Autobind).is_match());
        assert!(!program.evaluate(&props, BindMode::Manual).is_match());
    }

    #[test]
    fn test_mask_and_ordering_conditions() {
        let props = PropertyTable::new(vec![DeviceProp::new(1, 0b1010)]);
        for (cond, value, expect) in [
            (Cond::Mask, 0b0010, true),
            (Cond::Mask, 0b0101, false),
            (Cond::Bits, 0b1010, true),
            (Cond::Bits, 0b1011, false),
            (Cond::Gt, 9, true),
            (Cond::Lt, 10, false),
            (Cond::Ge, 10, true),
            (Cond::Le, 9, false),
        ] {
            let program =
                BindProgram::new("t", "0", vec![BindInst::match_if(cond, 1, value)]).unwrap();
            assert_eq!(
                program.evaluate(&props, BindMode::Manual).is_match(),
                expect,
                "{cond:?} {value:#b}"
            );
        }
    }

    #[test]
    fn test_backward_jump_rejected() {
        let err = BindProgram::new(
            "test",
            "0.1",
            vec![BindInst::label(1), BindInst::goto(1)],
        )
        .unwrap_err();
        assert_eq!(
            err,
            BindProgramError::BackwardJump {
                label: 1,
                from: 1,
                to: 0
            }
        );
    }

    #[test]
    fn test_unresolved_and_duplicate_labels_rejected() {
        assert!(matches!(
            BindProgram::new("t", "0", vec![BindInst::goto(3)]),
            Err(BindProgramError::UnresolvedLabel { label: 3, index: 0 })
        ));
        assert!(matches!(
            BindProgram::new("t", "0", vec![BindInst::label(2), BindInst::label(2)]),
            Err(BindProgramError::DuplicateLabel { label: 2, index: 1 })
        ));
    }

    #[test]
    fn test_binary_layout() {
        let program = ahci_program();
        let bytes = program.to_bytes();
        assert_eq!(&bytes[..4], b"BIND");
        let decoded = BindProgram::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, program);
        assert_eq!(decoded.vendor(), "test");

        assert_eq!(
            BindProgram::from_bytes(&bytes[..bytes.len() - 1]),
            Err(BindProgramError::Truncated)
        );
        let mut extra = bytes.clone();
        extra.push(0);
        assert_eq!(
            BindProgram::from_bytes(&extra),
            Err(BindProgramError::TrailingData(1))
        );

        let mut bad_op = bytes;
        let first = bad_op.len() - 4 * INST_WIRE_SIZE;
        bad_op[first] = 0x42;
        assert_eq!(
            BindProgram::from_bytes(&bad_op),
            Err(BindProgramError::UnknownOpcode {
                index: 0,
                opcode: 0x42
            })
        );
    }

    #[test]
    fn test_evaluation_terminates_for_chained_forward_jumps() {
        // Every directive jumps to the next label; the program must still end.
        let mut insts = Vec::new();
        for label in 0..64u16 {
            insts.push(BindInst::goto(label));
            insts.push(BindInst::label(label));
        }
        let program = BindProgram::new("t", "0", insts).unwrap();
        let outcome = program.evaluate(&PropertyTable::empty(), BindMode::Autobind);
        assert_eq!(outcome.result, BindResult::NoMatch);
    }
}
