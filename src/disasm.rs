//! x86-64 disassembly facade over `iced-x86`: single-instruction decode,
//! NOP-sled generation, masked AOB signature generation, and the Jcc
//! byte-flip used to invert a conditional jump in place.

use iced_x86::{
    ConstantOffsets, Decoder, DecoderOptions, FlowControl, Formatter, Instruction,
    InstructionInfoFactory, IntelFormatter, OpAccess, OpKind,
};

use crate::error::{Error, Result};

/// One decoded instruction: its address, raw bytes, and formatted text, plus
/// the facts about it the code-patch/access-tracking paths need without
/// re-decoding.
#[derive(Debug, Clone)]
pub struct DecodedInsn {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub text: String,
    pub len: usize,
    pub operands: Vec<String>,
    pub reads_memory: bool,
    pub writes_memory: bool,
    pub is_branch: bool,
    pub is_conditional: bool,
    pub branch_target: Option<u64>,
}

/// Derives the operand list, memory-access flags, and branch-target facts
/// for an already-decoded instruction.
fn describe(insn: &Instruction, formatter: &mut IntelFormatter) -> (Vec<String>, bool, bool, bool, bool, Option<u64>) {
    let mut operands = Vec::with_capacity(insn.op_count() as usize);
    for i in 0..insn.op_count() {
        let mut text = String::new();
        formatter.format_operand(insn, &mut text, i);
        operands.push(text);
    }

    let mut reads_memory = false;
    let mut writes_memory = false;
    let mut info_factory = InstructionInfoFactory::new();
    let info = info_factory.info(insn);
    for used_mem in info.used_memory() {
        match used_mem.access() {
            OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite => {
                reads_memory = true
            }
            _ => {}
        }
        match used_mem.access() {
            OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite => {
                writes_memory = true
            }
            _ => {}
        }
    }

    let is_conditional = matches!(insn.flow_control(), FlowControl::ConditionalBranch);
    let is_branch = is_conditional
        || matches!(
            insn.flow_control(),
            FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
        );

    let branch_target = match insn.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Some(insn.near_branch_target()),
        _ => None,
    };

    (operands, reads_memory, writes_memory, is_branch, is_conditional, branch_target)
}

#[derive(Debug, Default)]
pub struct Disassembler;

impl Disassembler {
    pub fn new() -> Self {
        Self
    }

    /// Decodes a single instruction starting at the front of `code`, which
    /// is addressed as if loaded at `address`.
    pub fn decode(&self, address: u64, code: &[u8]) -> Result<DecodedInsn> {
        let mut decoder = Decoder::with_ip(64, code, address, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return Err(Error::DecodeFailure { address });
        }

        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(Error::DecodeFailure { address });
        }

        let mut formatter = IntelFormatter::new();
        let mut text = String::new();
        formatter.format(&insn, &mut text);
        let (operands, reads_memory, writes_memory, is_branch, is_conditional, branch_target) =
            describe(&insn, &mut formatter);

        let len = insn.len();
        Ok(DecodedInsn {
            address,
            bytes: code[..len].to_vec(),
            mnemonic: format!("{:?}", insn.mnemonic()),
            text,
            len,
            operands,
            reads_memory,
            writes_memory,
            is_branch,
            is_conditional,
            branch_target,
        })
    }

    /// Decodes every instruction in `code` until the bytes run out or a
    /// decode failure is hit, returning what was decoded so far.
    pub fn decode_all(&self, address: u64, code: &[u8]) -> Vec<DecodedInsn> {
        let mut decoder = Decoder::with_ip(64, code, address, DecoderOptions::NONE);
        let mut formatter = IntelFormatter::new();
        let mut out = Vec::new();

        while decoder.can_decode() {
            let insn = decoder.decode();
            if insn.is_invalid() {
                break;
            }
            let mut text = String::new();
            formatter.format(&insn, &mut text);
            let (operands, reads_memory, writes_memory, is_branch, is_conditional, branch_target) =
                describe(&insn, &mut formatter);

            let len = insn.len();
            let start = (insn.ip() - address) as usize;
            out.push(DecodedInsn {
                address: insn.ip(),
                bytes: code[start..start + len].to_vec(),
                mnemonic: format!("{:?}", insn.mnemonic()),
                text,
                len,
                operands,
                reads_memory,
                writes_memory,
                is_branch,
                is_conditional,
                branch_target,
            });
        }

        out
    }

    /// `0x90` repeated `len` times — the NOP sled used to blank out a patched
    /// instruction's remaining bytes.
    pub fn nop_bytes(&self, len: usize) -> Vec<u8> {
        vec![0x90; len]
    }

    /// Builds a masked AOB signature for the instruction at `address`:
    /// opcode and ModRM/SIB bytes are kept literal, while displacement and
    /// immediate bytes (anything position- or value-dependent) are masked.
    pub fn wildcard_aob(&self, address: u64, code: &[u8]) -> Result<(Vec<u8>, Vec<bool>)> {
        let mut decoder = Decoder::with_ip(64, code, address, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return Err(Error::DecodeFailure { address });
        }

        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(Error::DecodeFailure { address });
        }

        let offsets: ConstantOffsets = decoder.get_constant_offsets(&insn);
        let len = insn.len();
        let bytes = code[..len].to_vec();
        let mut mask = vec![true; len];

        mask_range(&mut mask, offsets.displacement_offset(), offsets.displacement_size());
        mask_range(&mut mask, offsets.immediate_offset(), offsets.immediate_size());
        mask_range(&mut mask, offsets.immediate_offset2(), offsets.immediate_size2());

        Ok((bytes, mask))
    }
}

fn mask_range(mask: &mut [bool], offset: u32, size: u32) {
    if size == 0 {
        return;
    }
    let start = offset as usize;
    let end = start + size as usize;
    for slot in mask.iter_mut().take(end.min(mask.len())).skip(start) {
        *slot = false;
    }
}

/// If `insn` is a short (`0x70..=0x7F`) or near (`0x0F 0x80..=0x8F`)
/// conditional jump, returns the byte offset (relative to the instruction's
/// first byte) of the condition byte whose low bit inverts the condition.
pub fn jcc_flip_offset(code: &[u8]) -> Option<usize> {
    match code.first()? {
        0x70..=0x7F => Some(0),
        0x0F => match code.get(1)? {
            0x80..=0x8F => Some(1),
            _ => None,
        },
        _ => None,
    }
}

/// Flips the low bit of the condition byte found by `jcc_flip_offset`,
/// inverting a conditional jump's sense in place.
pub fn invert_jcc_bytes(code: &mut [u8]) -> Result<()> {
    let offset = jcc_flip_offset(code).ok_or(Error::DecodeFailure { address: 0 })?;
    code[offset] ^= 0x01;
    Ok(())
}

/// True when `code` is a control-flow instruction for which byte-level
/// wildcarding of displacement bytes would be unsafe without re-deriving the
/// target (e.g. `CALL`/`JMP` rel32), used by callers before trusting a
/// generated AOB signature across process restarts.
pub fn is_relative_control_flow(mnemonic: &str) -> bool {
    matches!(mnemonic, "Call" | "Jmp" | "Loop" | "Loope" | "Loopne" | "Jcxz" | "Jecxz" | "Jrcxz")
        || mnemonic.starts_with("J")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_simple_mov() {
        let disasm = Disassembler::new();
        // mov eax, 0x1
        let code = [0xB8, 0x01, 0x00, 0x00, 0x00];
        let insn = disasm.decode(0x1000, &code).unwrap();
        assert_eq!(insn.len, 5);
        assert_eq!(insn.address, 0x1000);
    }

    #[test]
    fn rejects_garbage_bytes() {
        let disasm = Disassembler::new();
        let code = [0x0F, 0x0B, 0x0F, 0x0B];
        // ud2 is actually valid; use a truncated prefix-only stream instead.
        let _ = disasm.decode(0x1000, &code);

        let empty: [u8; 0] = [];
        assert!(disasm.decode(0x1000, &empty).is_err());
    }

    #[test]
    fn nop_bytes_are_all_0x90() {
        let disasm = Disassembler::new();
        assert_eq!(disasm.nop_bytes(3), vec![0x90, 0x90, 0x90]);
    }

    #[test]
    fn mov_reg_imm_touches_no_memory_and_has_one_operand() {
        let disasm = Disassembler::new();
        // mov eax, 0x1
        let code = [0xB8, 0x01, 0x00, 0x00, 0x00];
        let insn = disasm.decode(0x1000, &code).unwrap();
        assert_eq!(insn.operands.len(), 2);
        assert!(!insn.reads_memory);
        assert!(!insn.writes_memory);
        assert!(!insn.is_branch);
        assert_eq!(insn.branch_target, None);
    }

    #[test]
    fn mov_to_memory_operand_sets_writes_memory() {
        let disasm = Disassembler::new();
        // mov [rax], ecx
        let code = [0x89, 0x08];
        let insn = disasm.decode(0x1000, &code).unwrap();
        assert!(insn.writes_memory);
        assert!(!insn.reads_memory);
    }

    #[test]
    fn short_conditional_jump_reports_branch_target() {
        let disasm = Disassembler::new();
        // je +2
        let code = [0x74, 0x02];
        let insn = disasm.decode(0x1000, &code).unwrap();
        assert!(insn.is_branch);
        assert!(insn.is_conditional);
        assert_eq!(insn.branch_target, Some(0x1004));
    }

    #[test]
    fn unconditional_jump_is_a_branch_but_not_conditional() {
        let disasm = Disassembler::new();
        // jmp +2
        let code = [0xEB, 0x02];
        let insn = disasm.decode(0x1000, &code).unwrap();
        assert!(insn.is_branch);
        assert!(!insn.is_conditional);
    }

    #[test]
    fn jcc_flip_offset_finds_short_jump() {
        // je +2
        let code = [0x74, 0x02];
        assert_eq!(jcc_flip_offset(&code), Some(0));
    }

    #[test]
    fn jcc_flip_offset_finds_near_jump() {
        // jne rel32
        let code = [0x0F, 0x85, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(jcc_flip_offset(&code), Some(1));
    }

    #[test]
    fn jcc_flip_offset_rejects_non_branch() {
        let code = [0x90];
        assert_eq!(jcc_flip_offset(&code), None);
    }

    #[test]
    fn invert_jcc_bytes_flips_low_bit() {
        let mut code = [0x74, 0x02]; // je
        invert_jcc_bytes(&mut code).unwrap();
        assert_eq!(code[0], 0x75); // jne
    }
}
