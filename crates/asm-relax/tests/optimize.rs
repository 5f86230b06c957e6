//! End-to-end layout tests through the public API.
//!
//! Each test builds an object the way an assembler front end would (data,
//! directives, branches, labels), lays it out, and checks offsets, sizes
//! and the emitted bytes.

use asm_relax::{
    layout, layout_with_diagnostics, AlignContents, AsmError, BytecodeContainer, BytecodeInfo,
    BytecodeRef, Contents, Diagnostics, Expr, Leb128Contents, Location, MultipleContents, Object,
    OptimizerConfig, RelaxableBranch, SourceLoc, SymbolTable,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn src(line: u32) -> SourceLoc {
    SourceLoc::line(line)
}

fn label_addr(obj: &Object, name: &str) -> u64 {
    obj.label_table()
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, addr)| addr)
        .unwrap_or_else(|| panic!("label `{name}` not laid out"))
}

fn repeated(bytes: &[u8]) -> BytecodeContainer {
    let mut inner = BytecodeContainer::new(0);
    inner.append_bytes(bytes);
    inner
}

// ─── Offset-setters ──────────────────────────────────────────────────────────

#[test]
fn align_places_next_bytecode_on_boundary() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.define_label(text, "first", src(1)).unwrap();
    obj.container_mut(text).append_byte(0x90);
    obj.container_mut(text)
        .append_align(AlignContents::new(4), src(2));
    obj.define_label(text, "next", src(3)).unwrap();
    obj.container_mut(text).append_byte(0xC3);

    let images = layout(&mut obj).unwrap();
    assert_eq!(images[0].bytes, vec![0x90, 0, 0, 0, 0xC3]);
    assert_eq!(label_addr(&obj, "first"), 0);
    assert_eq!(label_addr(&obj, "next"), 4);
}

#[test]
fn align_with_fill_byte() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.container_mut(text).append_bytes(&[1, 2, 3]);
    obj.container_mut(text)
        .append_align(AlignContents::new(8).with_fill(0xCC), src(2));
    let images = layout(&mut obj).unwrap();
    assert_eq!(images[0].bytes, vec![1, 2, 3, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]);
}

#[test]
fn align_max_skip_drops_padding() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.container_mut(text).append_byte(0x90);
    obj.container_mut(text)
        .append_align(AlignContents::new(16).with_max_skip(4), src(2));
    obj.container_mut(text).append_byte(0xC3);
    let images = layout(&mut obj).unwrap();
    assert_eq!(images[0].bytes, vec![0x90, 0xC3]);
}

#[test]
fn org_pads_to_offset() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0x7C00);
    obj.container_mut(text).append_bytes(&[0xEB, 0xFE]);
    obj.container_mut(text).append_org(6, 0xFF, src(2));
    obj.define_label(text, "sig", src(3)).unwrap();
    obj.container_mut(text).append_bytes(&[0x55, 0xAA]);

    let images = layout(&mut obj).unwrap();
    assert_eq!(images[0].start, 0x7C00);
    assert_eq!(images[0].bytes, vec![0xEB, 0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0x55, 0xAA]);
    assert_eq!(label_addr(&obj, "sig"), 0x7C06);
}

#[test]
fn org_behind_current_offset_is_an_overlap() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.container_mut(text).append_bytes(&[0; 20]);
    obj.container_mut(text).append_org(10, 0, src(7));
    let err = layout(&mut obj).unwrap_err();
    assert_eq!(
        err,
        AsmError::OrgOverlap {
            target: 10,
            current: 20,
            loc: src(7),
        }
    );
}

// ─── Branch relaxation ───────────────────────────────────────────────────────

#[test]
fn short_branches_stay_short() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.define_label(text, "top", src(1)).unwrap();
    obj.container_mut(text).append_bytes(&[0x90; 3]);
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jcc(0x5, "top"), src(2));
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("done"), src(3));
    obj.container_mut(text).append_bytes(&[0x90; 4]);
    obj.define_label(text, "done", src(5)).unwrap();

    let images = layout(&mut obj).unwrap();
    // jne top: -(3 + 2); jmp done: +4
    assert_eq!(
        images[0].bytes,
        vec![0x90, 0x90, 0x90, 0x75, 0xFB, 0xEB, 0x04, 0x90, 0x90, 0x90, 0x90]
    );
}

#[test]
fn short_range_boundaries() {
    // A forward jump over 127 bytes fits; over 128 it does not.
    for (gap, long) in [(127usize, false), (128, true)] {
        let mut obj = Object::new();
        let text = obj.add_section(".text", 0);
        obj.container_mut(text)
            .append_branch(RelaxableBranch::jmp("end"), src(1));
        obj.container_mut(text).append_bytes(&vec![0x90; gap]);
        obj.define_label(text, "end", src(2)).unwrap();
        let images = layout(&mut obj).unwrap();
        let expected = if long { gap + 5 } else { gap + 2 };
        assert_eq!(images[0].len(), expected, "gap {gap}");
    }

    // Backward: -128 fits, -129 does not.
    for (gap, long) in [(126usize, false), (127, true)] {
        let mut obj = Object::new();
        let text = obj.add_section(".text", 0);
        obj.define_label(text, "top", src(1)).unwrap();
        obj.container_mut(text).append_bytes(&vec![0x90; gap]);
        obj.container_mut(text)
            .append_branch(RelaxableBranch::jmp("top"), src(2));
        let images = layout(&mut obj).unwrap();
        let expected = if long { gap + 5 } else { gap + 2 };
        assert_eq!(images[0].len(), expected, "gap {gap}");
    }
}

#[test]
fn align_then_far_jump() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.container_mut(text).append_byte(0x90);
    obj.container_mut(text)
        .append_align(AlignContents::new(8).with_nop_fill(), src(2));
    obj.define_label(text, "jump", src(3)).unwrap();
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("label"), src(3));
    obj.container_mut(text).append_bytes(&[0xCC; 200]);
    obj.define_label(text, "label", src(5)).unwrap();

    let images = layout(&mut obj).unwrap();
    let bytes = &images[0].bytes;
    assert_eq!(bytes[0], 0x90);
    // one 7-byte NOP
    assert_eq!(&bytes[1..8], &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(label_addr(&obj, "jump"), 8);
    assert_eq!(&bytes[8..13], &[0xE9, 200, 0, 0, 0]);
    assert_eq!(label_addr(&obj, "label"), 213);
    assert_eq!(bytes.len(), 213);
}

#[test]
fn align_absorbs_growth_of_earlier_branch() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.define_label(text, "top", src(1)).unwrap();
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("far"), src(2));
    obj.container_mut(text)
        .append_align(AlignContents::new(16), src(3));
    obj.container_mut(text).append_bytes(&[0x90; 100]);
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("top"), src(5));
    obj.container_mut(text).append_bytes(&[0x90; 150]);
    obj.define_label(text, "far", src(7)).unwrap();

    let images = layout(&mut obj).unwrap();
    let bytes = &images[0].bytes;
    // the forward jump widened, the align shrank from 14 to 11 bytes and
    // the backward jump kept its short form
    assert_eq!(&bytes[0..5], &[0xE9, 0x07, 0x01, 0x00, 0x00]);
    assert!(bytes[5..16].iter().all(|&b| b == 0));
    assert_eq!(&bytes[116..118], &[0xEB, 0x8A]);
    assert_eq!(label_addr(&obj, "far"), 268);
}

#[test]
fn branch_growth_ripples_through_align() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.define_label(text, "top", src(1)).unwrap();
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("far"), src(2));
    obj.container_mut(text).append_bytes(&[0x90; 124]);
    obj.define_label(text, "back", src(4)).unwrap();
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("top"), src(4));
    obj.container_mut(text)
        .append_align(AlignContents::new(8), src(5));
    obj.define_label(text, "aligned", src(6)).unwrap();
    obj.container_mut(text).append_bytes(&[0x90; 200]);
    obj.define_label(text, "far", src(7)).unwrap();

    let mut diags = Diagnostics::new();
    obj.finalize(&mut diags);
    let stats = obj.optimize(&mut diags).unwrap();
    assert!(!diags.has_errors());
    // the far jump widens before layout; that pushes the backward jump out
    // of range, and its growth is absorbed by the align
    assert_eq!(stats.initial_qb, 1);
    assert_eq!(stats.expansions, 1);
    assert_eq!(stats.offset_setters, 1);

    assert_eq!(label_addr(&obj, "back"), 129);
    assert_eq!(label_addr(&obj, "aligned"), 136);
    assert_eq!(label_addr(&obj, "far"), 336);

    let image = obj.output_section(text).unwrap();
    assert_eq!(&image.bytes[0..5], &[0xE9, 0x4B, 0x01, 0x00, 0x00]);
    // jmp top from 129: -134
    assert_eq!(&image.bytes[129..134], &[0xE9, 0x7A, 0xFF, 0xFF, 0xFF]);
    assert_eq!(&image.bytes[134..136], &[0, 0]);
}

#[test]
fn second_optimize_is_stable() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.define_label(text, "top", src(1)).unwrap();
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("far"), src(2));
    obj.container_mut(text).append_bytes(&[0x90; 124]);
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("top"), src(4));
    obj.container_mut(text)
        .append_align(AlignContents::new(8), src(5));
    obj.container_mut(text).append_bytes(&[0x90; 200]);
    obj.define_label(text, "far", src(7)).unwrap();

    let first = layout(&mut obj).unwrap();
    let labels = obj.label_table();

    let mut diags = Diagnostics::new();
    let stats = obj.optimize(&mut diags).unwrap();
    assert_eq!(stats.expansions, 0);
    assert_eq!(obj.label_table(), labels);
    assert_eq!(obj.output_section(text).unwrap(), first[0]);
}

// ─── Repetitions ─────────────────────────────────────────────────────────────

#[test]
fn constant_repetition() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.container_mut(text)
        .append_multiple(3, repeated(&[0xAB, 0xCD]), src(1));
    obj.container_mut(text).append_byte(0xC3);
    let images = layout(&mut obj).unwrap();
    assert_eq!(images[0].bytes, vec![0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD, 0xC3]);
}

#[test]
fn repetition_count_from_equ() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.define_equ("N", Expr::mul(2, 3), src(1)).unwrap();
    obj.container_mut(text)
        .append_multiple("N", repeated(&[0x90]), src(2));
    let images = layout(&mut obj).unwrap();
    assert_eq!(images[0].len(), 6);
}

#[test]
fn repetition_count_settles_before_branches() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.define_label(text, "top", src(1)).unwrap();
    obj.container_mut(text)
        .append_multiple(Expr::sub("b", "a"), repeated(&[0xCC; 8]), src(2));
    obj.define_label(text, "a", src(3)).unwrap();
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("far"), src(3));
    obj.define_label(text, "b", src(4)).unwrap();
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("zfar"), src(4));
    obj.container_mut(text).append_bytes(&[0x90; 80]);
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("top"), src(6));
    obj.container_mut(text).append_bytes(&[0x90; 42]);
    obj.define_label(text, "far", src(8)).unwrap();
    obj.container_mut(text).append_bytes(&[0x90; 200]);
    obj.define_label(text, "zfar", src(9)).unwrap();

    let mut diags = Diagnostics::new();
    obj.finalize(&mut diags);
    let stats = obj.optimize(&mut diags).unwrap();
    // jmp far widens, which grows the count from 2 to 5, which pushes
    // jmp top out of range
    assert_eq!(stats.expansions, 3);
    assert_eq!(stats.qa_pops, 1);
    assert_eq!(stats.qb_pops, 2);

    assert_eq!(label_addr(&obj, "a"), 40);
    assert_eq!(label_addr(&obj, "b"), 45);
    assert_eq!(label_addr(&obj, "far"), 177);
    assert_eq!(label_addr(&obj, "zfar"), 377);

    let image = obj.output_section(text).unwrap();
    assert!(image.bytes[..40].iter().all(|&b| b == 0xCC));
    assert_eq!(&image.bytes[40..45], &[0xE9, 0x84, 0x00, 0x00, 0x00]);
    assert_eq!(&image.bytes[130..135], &[0xE9, 0x79, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn repetition_measuring_itself_is_circular() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.define_label(text, "start", src(1)).unwrap();
    obj.container_mut(text).append_byte(0x90);
    obj.container_mut(text)
        .append_multiple(Expr::sub("end", "start"), repeated(&[0]), src(2));
    obj.define_label(text, "end", src(3)).unwrap();

    let err = layout(&mut obj).unwrap_err();
    assert_eq!(err, AsmError::CircularReference { loc: src(2) });
}

#[test]
fn mutually_dependent_repetitions_are_rejected() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.define_label(text, "top", src(1)).unwrap();
    obj.container_mut(text).append_byte(0x90);
    obj.container_mut(text)
        .append_multiple(Expr::sub("y", "x"), repeated(&[0xAA]), src(2));
    obj.define_label(text, "x", src(3)).unwrap();
    obj.container_mut(text)
        .append_multiple(Expr::sub("x", "top"), repeated(&[0xBB]), src(3));
    obj.define_label(text, "y", src(4)).unwrap();

    let errors = layout(&mut obj).unwrap_err().into_errors();
    assert!(!errors.is_empty());
    assert!(errors
        .iter()
        .all(|e| matches!(e, AsmError::CircularReference { .. })));
}

#[test]
fn negative_repetition_count() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.container_mut(text)
        .append_multiple(-1, repeated(&[0]), src(9));
    let err = layout(&mut obj).unwrap_err();
    assert!(matches!(err, AsmError::Value { loc, .. } if loc == src(9)));
}

// ─── LEB128 ──────────────────────────────────────────────────────────────────

#[test]
fn leb128_grows_with_the_distance_it_encodes() {
    let mut obj = Object::new();
    let data = obj.add_section(".data", 0);
    obj.define_label(data, "start", src(1)).unwrap();
    obj.container_mut(data)
        .append_leb128(Expr::sub("end", "start"), false, src(2));
    obj.container_mut(data).append_bytes(&[0; 127]);
    obj.define_label(data, "end", src(4)).unwrap();

    let images = layout(&mut obj).unwrap();
    // 1 + 127 = 128 does not fit one byte; with two it is 129
    assert_eq!(&images[0].bytes[..2], &[0x81, 0x01]);
    assert_eq!(images[0].len(), 129);
}

#[test]
fn leb128_constants() {
    let mut obj = Object::new();
    let data = obj.add_section(".data", 0);
    obj.container_mut(data).append_leb128(624_485, false, src(1));
    obj.container_mut(data).append_leb128(-123_456, true, src(2));
    let images = layout(&mut obj).unwrap();
    assert_eq!(images[0].bytes, vec![0xE5, 0x8E, 0x26, 0xC0, 0xBB, 0x78]);
}

// ─── Values, symbols and sections ────────────────────────────────────────────

#[test]
fn values_resolve_label_differences() {
    let mut obj = Object::new();
    let data = obj.add_section(".data", 0);
    obj.define_label(data, "start", src(1)).unwrap();
    obj.container_mut(data)
        .append_value(16, Expr::sub("end", "start"), src(2));
    obj.container_mut(data).append_gap(6, src(3));
    obj.define_label(data, "end", src(4)).unwrap();
    let images = layout(&mut obj).unwrap();
    assert_eq!(images[0].bytes, vec![8, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn external_values_leave_relocations() {
    let mut obj = Object::new();
    let data = obj.add_section(".data", 0);
    obj.container_mut(data).append_bytes(&[0xFF; 2]);
    obj.container_mut(data)
        .append_value(32, Expr::add("printf", 4), src(2));
    let images = layout(&mut obj).unwrap();
    assert_eq!(images[0].bytes, vec![0xFF, 0xFF, 4, 0, 0, 0]);
    let reloc = &images[0].relocs[0];
    assert_eq!(reloc.offset, 2);
    assert_eq!(reloc.size, 4);
    assert_eq!(reloc.symbol, "printf");
    assert_eq!(reloc.addend, 4);
    assert!(!reloc.pc_relative);
}

#[test]
fn external_branch_is_long_with_pc_relative_reloc() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.container_mut(text)
        .append_branch(RelaxableBranch::call("puts"), src(1));
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("exit"), src(2));
    let images = layout(&mut obj).unwrap();
    assert_eq!(images[0].len(), 10);
    assert_eq!(images[0].bytes[0], 0xE8);
    assert_eq!(images[0].bytes[5], 0xE9);
    let relocs = &images[0].relocs;
    assert_eq!(relocs.len(), 2);
    assert_eq!((relocs[0].offset, relocs[0].addend), (1, -4));
    assert_eq!((relocs[1].offset, relocs[1].addend), (6, -4));
    assert!(relocs.iter().all(|r| r.pc_relative && r.size == 4));
}

#[test]
fn cross_section_branch_uses_long_form() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    let other = obj.add_section(".text.cold", 0x1000);
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("cold"), src(1));
    obj.define_label(other, "cold", src(2)).unwrap();
    obj.container_mut(other).append_byte(0xC3);

    let images = layout(&mut obj).unwrap();
    // 0x1000 - 5
    assert_eq!(images[0].bytes, vec![0xE9, 0xFB, 0x0F, 0x00, 0x00]);
    assert_eq!(images[1].bytes, vec![0xC3]);
}

#[test]
fn duplicate_label_is_rejected() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.define_label(text, "x", src(1)).unwrap();
    let err = obj.define_label(text, "x", src(5)).unwrap_err();
    assert!(matches!(
        err,
        AsmError::DuplicateLabel { ref label, loc, first_loc }
            if label == "x" && loc == src(5) && first_loc == src(1)
    ));
}

#[test]
fn errors_are_collected_across_bytecodes() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.container_mut(text)
        .append_align(AlignContents::new(3), src(1));
    obj.container_mut(text).append_byte(0);
    obj.container_mut(text)
        .append_align(AlignContents::new(6), src(2));
    let err = layout(&mut obj).unwrap_err();
    let errors = err.into_errors();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].loc(), Some(src(1)));
    assert_eq!(errors[1].loc(), Some(src(2)));
}

#[test]
fn error_cap_from_config() {
    let mut obj = Object::with_config(OptimizerConfig {
        max_errors: 1,
        ..OptimizerConfig::default()
    });
    let text = obj.add_section(".text", 0);
    for line in 1..=3 {
        obj.container_mut(text)
            .append_align(AlignContents::new(5), src(line));
    }
    let err = layout(&mut obj).unwrap_err();
    let errors = err.into_errors();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].loc(), Some(src(1)));
    assert_eq!(errors[1], AsmError::Suppressed { count: 2 });
}

#[test]
fn zero_error_cap_still_fails_layout() {
    let mut obj = Object::with_config(OptimizerConfig {
        max_errors: 0,
        ..OptimizerConfig::default()
    });
    let text = obj.add_section(".text", 0);
    obj.container_mut(text).append_value(8, 256, src(1));
    let (result, diags) = layout_with_diagnostics(&mut obj);
    assert_eq!(result.unwrap_err(), AsmError::Suppressed { count: 1 });
    assert!(diags.errors().is_empty());
    assert_eq!(diags.dropped(), 1);
}

#[test]
fn zero_size_value_is_an_error() {
    let mut obj = Object::new();
    let text = obj.add_section(".text", 0);
    obj.container_mut(text).append_value(0, 1, src(3));
    let err = layout(&mut obj).unwrap_err();
    assert!(matches!(err, AsmError::Value { loc, .. } if loc == src(3)));
}

// ─── Contents contract ───────────────────────────────────────────────────────

fn contents_info(index: usize, offset: u64) -> BytecodeInfo {
    BytecodeInfo {
        bc: BytecodeRef::new(0, index),
        offset,
        fixed_len: 0,
        tail_len: 0,
        index,
        source: src(index as u32),
    }
}

/// Finalize `contents`, then run `calc_len` twice and return both results.
fn calc_len_twice(
    contents: &mut dyn Contents,
    info: &BytecodeInfo,
) -> [(u64, Vec<(i32, i64, i64)>); 2] {
    let mut symbols = SymbolTable::new();
    let a = Location::new(BytecodeRef::new(0, 1), 0);
    let b = Location::new(BytecodeRef::new(0, 9), 0);
    symbols.define_label("a", a, src(1)).unwrap();
    symbols.define_label("b", b, src(9)).unwrap();
    contents
        .finalize(info, &symbols, &mut Diagnostics::new())
        .unwrap();
    [(), ()].map(|_| {
        let mut spans = Vec::new();
        let len = contents
            .calc_len(info, &mut |id, _, lo, hi| spans.push((id, lo, hi)))
            .unwrap();
        (len, spans)
    })
}

#[test]
fn calc_len_is_idempotent() {
    let info = contents_info(4, 3);

    let mut branch = RelaxableBranch::jmp("b");
    let [first, second] = calc_len_twice(&mut branch, &info);
    assert_eq!(first, second);
    assert_eq!(first.1.len(), 1);

    let mut leb = Leb128Contents::new(Expr::sub("b", "a"), false);
    let [first, second] = calc_len_twice(&mut leb, &info);
    assert_eq!(first, second);
    assert!(!first.1.is_empty());

    let mut align = AlignContents::new(8);
    let [first, second] = calc_len_twice(&mut align, &info);
    assert_eq!(first, second);
    assert_eq!(first.0, 5);

    let mut body = BytecodeContainer::new(0);
    body.append_byte(0xAA);
    body.append_branch(RelaxableBranch::jmp("a"), src(5));
    let mut times = MultipleContents::new(Expr::sub("b", "a"), body);
    let [first, second] = calc_len_twice(&mut times, &info);
    assert_eq!(first, second);
    assert!(first.1.iter().any(|&(id, _, _)| id <= 0));
}
