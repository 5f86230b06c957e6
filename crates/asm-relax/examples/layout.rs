//! Layout example: relaxable branches, alignment and a length prefix.
//!
//! Builds a small `.text` section by hand, lays it out and prints the
//! resulting bytes together with the final label addresses.
//!
//! Run with: `cargo run --example layout`

use asm_relax::{
    layout_with_diagnostics, AlignContents, Expr, Object, RelaxableBranch, SectionImage,
    SourceLoc,
};

fn main() {
    println!("=== asm_relax layout example ===\n");

    let mut obj = Object::new();
    let text = obj.add_section(".text", 0x40_1000);
    let data = obj.add_section(".data", 0x40_2000);

    // entry: xor eax, eax / jmp check
    obj.define_label(text, "entry", SourceLoc::line(1)).unwrap();
    obj.container_mut(text).append_bytes(&[0x31, 0xC0]);
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jmp("check"), SourceLoc::line(2));

    // .align 16 padded with multi-byte NOPs
    obj.container_mut(text)
        .append_align(AlignContents::new(16).with_nop_fill(), SourceLoc::line(3));

    // body: a long loop body pushes `check` out of short range
    obj.define_label(text, "body", SourceLoc::line(4)).unwrap();
    obj.container_mut(text).append_bytes(&[0x90; 150]);
    obj.container_mut(text).append_bytes(&[0xFF, 0xC0]); // inc eax

    // check: cmp eax, 10 / jl body / call puts / ret
    obj.define_label(text, "check", SourceLoc::line(7)).unwrap();
    obj.container_mut(text).append_bytes(&[0x83, 0xF8, 0x0A]);
    obj.container_mut(text)
        .append_branch(RelaxableBranch::jcc(0xC, "body"), SourceLoc::line(8));
    obj.container_mut(text)
        .append_branch(RelaxableBranch::call("puts"), SourceLoc::line(9));
    obj.container_mut(text).append_byte(0xC3);
    obj.define_label(text, "text_end", SourceLoc::line(11)).unwrap();

    // .data: uleb128 length of .text followed by a message
    obj.container_mut(data).append_leb128(
        Expr::sub("text_end", "entry"),
        false,
        SourceLoc::line(13),
    );
    obj.container_mut(data).append_bytes(b"hello\0");

    let (result, diags) = layout_with_diagnostics(&mut obj);
    for warning in diags.warnings() {
        println!("warning: {warning}");
    }
    let images = match result {
        Ok(images) => images,
        Err(e) => {
            eprintln!("layout failed: {e}");
            std::process::exit(1);
        }
    };

    for image in &images {
        print_image(image);
    }

    println!("\nLabels:");
    for (name, addr) in obj.label_table() {
        println!("  {name:<10} {addr:#x}");
    }
}

fn print_image(image: &SectionImage) {
    println!(
        "{} @ {:#x} ({} bytes)",
        image.name,
        image.start,
        image.len()
    );
    for (i, chunk) in image.bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
        println!("  {:#06x}: {}", i * 16, hex.join(" "));
    }
    for reloc in &image.relocs {
        println!(
            "  reloc @ {:#x}: {} {:+} ({} bytes{})",
            reloc.offset,
            reloc.symbol,
            reloc.addend,
            reloc.size,
            if reloc.pc_relative { ", pc-relative" } else { "" }
        );
    }
}
