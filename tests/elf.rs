use unwindstack::elf::Elf;
use unwindstack::regs::arm;
use unwindstack::{Arch, ArcData, MemorySnapshot, Regs, UnwindObject};

mod common;

use common::{
    arm_exidx_image, build_id_note, debug_frame, eh_frame, note, xz, Cfi, ElfBuilder,
};

fn parse(image: Vec<u8>) -> Elf {
    Elf::new(ArcData::from_vec(image))
}

#[test]
fn soname_is_read_through_the_dynamic_segment() {
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .soname("libfake.so", None)
            .build(),
    );
    assert!(elf.valid());
    assert_eq!(elf.soname(), Some("libfake.so"));
}

#[test]
fn soname_is_bounded_by_the_string_table_size() {
    // "\0libfake.so\0" is 12 bytes; 8 cuts the name short.
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .soname("libfake.so", Some(8))
            .build(),
    );
    assert!(elf.valid());
    assert_eq!(elf.soname(), None);

    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .soname("libfake.so", Some(1))
            .build(),
    );
    assert_eq!(elf.soname(), None);
}

#[test]
fn build_id_after_a_foreign_note() {
    let mut notes = note(b"WRONG\0", object::elf::NT_GNU_BUILD_ID, &[1, 2, 3, 4]);
    notes.extend(build_id_note(&[0xde, 0xad, 0xbe, 0xef]));
    let elf = parse(ElfBuilder::new(Arch::X86_64).notes(notes).build());
    assert_eq!(elf.build_id(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
    assert_eq!(elf.build_id_hex().as_deref(), Some("deadbeef"));
}

#[test]
fn images_without_an_executable_load_are_invalid() {
    let elf = parse(ElfBuilder::new(Arch::X86_64).without_load().build());
    assert!(!elf.valid());
    assert_eq!(elf.arch(), Arch::Unknown);
    assert_eq!(elf.function_name(0), None);

    let elf = parse(b"not an elf file at all".to_vec());
    assert!(!elf.valid());
}

#[test]
fn architecture_is_checked() {
    let image = ElfBuilder::new(Arch::Arm64).build();
    let elf = parse(image.clone()).check_arch(Arch::Arm64);
    assert!(elf.valid());
    assert_eq!(elf.arch(), Arch::Arm64);
    let elf = parse(image).check_arch(Arch::X86_64);
    assert!(!elf.valid());
}

#[test]
fn valid_pcs_follow_the_executable_segment() {
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .load_vaddr(0x5000)
            .load_memsz(0x1000)
            .build(),
    );
    assert_eq!(elf.load_bias(), 0x5000);
    assert!(!elf.is_valid_pc(0x4fff));
    assert!(elf.is_valid_pc(0x5000));
    assert!(elf.is_valid_pc(0x5fff));
    assert!(!elf.is_valid_pc(0x6000));
}

#[test]
fn header_info_bounds_the_file() {
    let image = ElfBuilder::new(Arch::X86_64).soname("libfake.so", None).build();
    let memory = MemorySnapshot::new();
    memory.set_memory(0, &image);
    let info = Elf::info(&memory).unwrap();
    assert_eq!(info.arch, Arch::X86_64);
    assert!(info.is_64);
    assert_eq!(info.size, image.len() as u64);
    assert!(Elf::is_valid_elf(&memory));
}

#[test]
fn global_variables_resolve_to_file_offsets() {
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .global("__jit_debug_descriptor", 0x3100)
            .data_section(0x3000, 0x2000, 0x200)
            .build(),
    );
    assert_eq!(elf.global_variable_offset("__jit_debug_descriptor"), Some(0x2100));
    assert_eq!(elf.global_variable_offset("__dex_debug_descriptor"), None);
}

#[test]
fn mini_debug_info_supplies_symbols_and_cfi() {
    let inner = ElfBuilder::new(Arch::X86_64)
        .without_load()
        .function("hidden", 0x2000, 0x100)
        .eh_frame(eh_frame(Arch::X86_64, &[(0x2000, 0x100, Cfi::Saved(16))]))
        .build();
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .function("visible", 0x1000, 0x100)
            .gnu_debugdata(xz(&inner))
            .build(),
    );
    assert!(elf.valid());
    assert_eq!(elf.function_name(0x1010), Some(("visible".to_string(), 0x10)));
    assert_eq!(elf.function_name(0x2020), Some(("hidden".to_string(), 0x20)));

    let memory = MemorySnapshot::new();
    memory.set_u64(0x7ff8, 0x1234);
    let mut regs = Regs::new(Arch::X86_64).unwrap();
    regs.set_sp(0x7ff0);
    let result = elf.step(0x2020, &mut regs, &memory).unwrap();
    assert!(!result.finished);
    assert_eq!((regs.pc(), regs.sp()), (0x1234, 0x8000));
}

#[test]
fn corrupt_mini_debug_info_is_ignored() {
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .function("visible", 0x1000, 0x100)
            .gnu_debugdata(b"\xfd7zXZ\0 garbage".to_vec())
            .build(),
    );
    assert!(elf.valid());
    assert_eq!(elf.function_name(0x2020), None);
    assert_eq!(elf.function_name(0x1000), Some(("visible".to_string(), 0)));
}

#[test]
fn missing_cfi_is_reported() {
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .eh_frame(eh_frame(Arch::X86_64, &[(0x1000, 0x10, Cfi::Outermost)]))
            .build(),
    );
    let memory = MemorySnapshot::new();
    let mut regs = Regs::new(Arch::X86_64).unwrap();
    assert!(elf.step(0x2000, &mut regs, &memory).is_err());

    let result = elf.step(0x1008, &mut regs, &memory).unwrap();
    assert!(result.finished);
    assert_eq!(regs.pc(), 0);
}

fn frames() -> [(u64, u32, Cfi); 2] {
    [(0x1000, 0x100, Cfi::Saved(16)), (0x2000, 0x100, Cfi::Outermost)]
}

fn step_from_0x1050(elf: &Elf) {
    let memory = MemorySnapshot::new();
    memory.set_u64(0x7ff8, 0x2010);
    let mut regs = Regs::new(Arch::X86_64).unwrap();
    regs.set_sp(0x7ff0);
    let result = elf.step(0x1050, &mut regs, &memory).unwrap();
    assert!(!result.finished);
    assert_eq!((regs.pc(), regs.sp()), (0x2010, 0x8000));

    let result = elf.step(0x2010, &mut regs, &memory).unwrap();
    assert!(result.finished);
}

#[test]
fn eh_frame_is_searched_through_its_header() {
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .eh_frame(eh_frame(Arch::X86_64, &frames()))
            .eh_frame_hdr()
            .build(),
    );
    assert!(elf.valid());
    let interface = elf.interface().unwrap();
    assert!(interface.eh_frame_hdr_info().is_some());
    let cfi = interface.eh_frame_cfi().unwrap();
    assert_eq!(cfi.fde_info(0x2008).map(|fde| fde.pc_begin), Some(0x2000));
    assert!(!cfi.is_valid_pc(0x1100));
    step_from_0x1050(&elf);
}

#[test]
fn eh_frame_is_found_from_its_header_alone() {
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .eh_frame(eh_frame(Arch::X86_64, &frames()))
            .eh_frame_hdr()
            .unnamed_eh_frame()
            .build(),
    );
    let interface = elf.interface().unwrap();
    assert!(interface.eh_frame_info().is_none());
    assert!(interface.eh_frame_cfi().is_some());
    step_from_0x1050(&elf);
}

#[test]
fn debug_frame_is_used_without_eh_frame() {
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .debug_frame(debug_frame(Arch::X86_64, &frames()))
            .build(),
    );
    let interface = elf.interface().unwrap();
    assert!(interface.eh_frame_cfi().is_none());
    assert!(interface.debug_frame_cfi().is_some());
    step_from_0x1050(&elf);
}

#[test]
fn debug_frame_covers_what_eh_frame_lacks() {
    let elf = parse(
        ElfBuilder::new(Arch::X86_64)
            .eh_frame(eh_frame(Arch::X86_64, &[(0x2000, 0x100, Cfi::Outermost)]))
            .eh_frame_hdr()
            .debug_frame(debug_frame(Arch::X86_64, &frames()))
            .build(),
    );
    step_from_0x1050(&elf);
}

#[test]
fn arm_exidx_unwinds_before_dwarf() {
    // 0x1000: "vsp += 16; pop {r4, r14}", 0x2000: cannot unwind.
    let elf = parse(arm_exidx_image(&[(0x1000, 0x8003_a8b0), (0x2000, 1)]));
    assert!(elf.valid());
    assert_eq!(elf.arch(), Arch::Arm);
    assert_eq!(elf.interface().unwrap().exidx().map(|e| e.entry_count()), Some(2));

    let memory = MemorySnapshot::new();
    memory.set_u32(0x8010, 0x44);
    memory.set_u32(0x8014, 0x2222);
    let mut regs = Regs::new(Arch::Arm).unwrap();
    regs.set_sp(0x8000);
    let result = elf.step(0x1004, &mut regs, &memory).unwrap();
    assert!(!result.finished);
    assert_eq!(regs.reg(4), Some(0x44));
    assert_eq!(regs.reg(arm::LR), Some(0x2222));
    assert_eq!((regs.pc(), regs.sp()), (0x2222, 0x8018));

    let result = elf.step(0x2004, &mut regs, &memory).unwrap();
    assert!(result.finished);

    // Below the first entry nothing covers the pc.
    assert!(elf.step(0x800, &mut regs, &memory).is_err());
}
