#![no_main]
use asm_relax::{AlignContents, Expr, Object, RelaxableBranch, SourceLoc};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Every pair of bytes is one item: an opcode and an operand.  Layout
    // must never panic, only return Ok/Err.
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0x1000);
    let mut labels = 0usize;

    for (n, pair) in data.chunks(2).take(256).enumerate() {
        let (op, arg) = (pair[0], pair.get(1).copied().unwrap_or(0));
        let src = SourceLoc::line(n as u32 + 1);
        let target = format!("L{}", usize::from(arg) % (labels + 2));
        let c = obj.container_mut(text);
        match op % 8 {
            0 => c.append_bytes(&vec![0x90; usize::from(arg)]),
            1 => {
                c.append_branch(RelaxableBranch::jmp(target.as_str()), src);
            }
            2 => {
                c.append_branch(RelaxableBranch::jcc(arg & 0xF, target.as_str()), src);
            }
            3 => {
                c.append_align(AlignContents::new(1i64 << (arg % 7)), src);
            }
            4 => {
                let _ = obj.define_label(text, &format!("L{labels}"), src);
                labels += 1;
            }
            5 => {
                c.append_leb128(Expr::sub(target.as_str(), "L0"), arg & 1 != 0, src);
            }
            6 => {
                c.append_org(u64::from(arg) * 4, 0xCC, src);
            }
            _ => {
                c.append_branch(RelaxableBranch::call(target.as_str()), src);
            }
        }
    }

    let _ = asm_relax::layout(&mut obj);
});
