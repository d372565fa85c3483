// Call-site rewriting through a session registry

use objc_lift::abi::sections;
use objc_lift::il::Intrinsic;
use objc_lift::image::{Symbol, SymbolKind};
use objc_lift::{Architecture, Expr, Function, Instruction, MemoryImage, Registry, SessionId, Settings};

const IMP: u64 = 0x1a00;
const MSG_SEND_SLOT: u64 = 0x1c00;
const RELEASE_SLOT: u64 = 0x1c08;
const STUB: u64 = 0x1e00;

/// Class `Foo` implementing `bar:`, selector references for `bar:` and
/// `baz`, a GOT with objc_msgSend and objc_release, and a string literal.
fn image() -> MemoryImage {
    let mut image = MemoryImage::new(Architecture::Aarch64);
    image.map_zeroed(0x1000, 0x2000);

    image.add_section(sections::CLASS_LIST, 0x1000, 0x1008);
    image.write_u64(0x1000, 0x1100).unwrap();
    image.write_u64(0x1100 + 32, 0x1200).unwrap();
    image.write_u64(0x1200 + 24, 0x1800).unwrap();
    image.write_u64(0x1200 + 32, 0x1300).unwrap();
    image.write_c_string(0x1800, "Foo").unwrap();
    image.write_c_string(0x1810, "bar:").unwrap();
    image.write_c_string(0x1820, "v24@0:8@16").unwrap();
    image.write_c_string(0x1830, "baz").unwrap();
    image.write_u32(0x1300, 24).unwrap();
    image.write_u32(0x1304, 1).unwrap();
    image.write_u64(0x1308, 0x1810).unwrap();
    image.write_u64(0x1310, 0x1820).unwrap();
    image.write_u64(0x1318, IMP).unwrap();

    image.add_section(sections::SELECTOR_REFS, 0x1900, 0x1910);
    image.write_u64(0x1900, 0x1810).unwrap();
    image.write_u64(0x1908, 0x1830).unwrap();

    image.add_section(sections::CF_STRINGS, 0x1b00, 0x1b20);
    image.write_u64(0x1b10, 0x1840).unwrap();
    image.write_u64(0x1b18, 5).unwrap();
    image.write_c_string(0x1840, "hello").unwrap();

    image.add_section(sections::GOT, 0x1c00, 0x1c10);
    image.add_symbol(Symbol::new("_objc_msgSend", MSG_SEND_SLOT, SymbolKind::ImportAddress));
    image.add_symbol(Symbol::new("_objc_release", RELEASE_SLOT, SymbolKind::ImportAddress));
    image
}

fn load(address: u64) -> Expr {
    Expr::load(Expr::ConstPtr(address), 8)
}

fn set(dest: &str, src: Expr) -> Instruction {
    Instruction::SetReg {
        dest: dest.into(),
        size: 8,
        src,
    }
}

fn ret() -> Instruction {
    Instruction::Ret {
        dest: Expr::reg("x30"),
    }
}

fn send(selector_ref: u64, target: Expr) -> Function {
    Function::new(
        0x3000,
        Architecture::Aarch64,
        vec![
            set("x1", load(selector_ref)),
            set("x16", target),
            Instruction::Call {
                outputs: vec!["x0".into()],
                dest: Expr::reg("x16"),
                args: vec![Expr::reg("x0"), Expr::reg("x1")],
            },
            ret(),
        ],
    )
}

#[test]
fn test_known_selector_becomes_direct_call() {
    let image = image();
    let registry = Registry::new();
    let mut f = send(0x1900, load(MSG_SEND_SLOT));

    let report = registry
        .process_function(SessionId(1), &image, &mut f, &Settings::default())
        .unwrap();

    assert_eq!(report.message_sends, 1);
    assert_eq!(
        f.instructions[2],
        Instruction::Call {
            outputs: vec!["x0".into()],
            dest: Expr::ConstPtr(IMP),
            args: vec![Expr::reg("x0"), Expr::reg("x1")],
        }
    );
}

#[test]
fn test_unimplemented_selector_is_untouched() {
    let image = image();
    let registry = Registry::new();
    let original = send(0x1908, load(MSG_SEND_SLOT));
    let mut f = original.clone();

    let report = registry
        .process_function(SessionId(1), &image, &mut f, &Settings::default())
        .unwrap();

    assert!(!report.changed());
    assert_eq!(f, original);
}

#[test]
fn test_arc_call_and_tail_call() {
    let image = image();
    let registry = Registry::new();
    let original = Function::new(
        0x3000,
        Architecture::Aarch64,
        vec![
            set("x16", load(RELEASE_SLOT)),
            Instruction::Call {
                outputs: vec![],
                dest: Expr::reg("x16"),
                args: vec![Expr::reg("x0")],
            },
            set("x16", load(RELEASE_SLOT)),
            Instruction::TailCall {
                dest: Expr::reg("x16"),
                args: vec![Expr::reg("x0")],
            },
        ],
    );

    let mut f = original.clone();
    let report = registry
        .process_function(SessionId(1), &image, &mut f, &Settings::default())
        .unwrap();
    assert_eq!(report.arc_calls_removed, 2);
    assert_eq!(f.instructions[1], Instruction::Nop);
    assert_eq!(f.instructions[3], ret());

    let mut kept = original.clone();
    registry
        .process_function(SessionId(1), &image, &mut kept, &Settings::default().with_arc_cleanup(false))
        .unwrap();
    assert_eq!(kept, original);
}

#[test]
fn test_string_literal_becomes_cfstr() {
    let image = image();
    let registry = Registry::new();
    let mut f = Function::new(
        0x3000,
        Architecture::Aarch64,
        vec![set("x2", Expr::ConstPtr(0x1b00)), ret()],
    );

    let report = registry
        .process_function(SessionId(1), &image, &mut f, &Settings::default())
        .unwrap();
    assert_eq!(report.string_literals, 1);
    assert_eq!(
        f.instructions[0],
        Instruction::Intrinsic {
            outputs: vec!["x2".into()],
            intrinsic: Intrinsic::CfStr,
            params: vec![Expr::ConstPtr(0x1840)],
        }
    );
}

#[test]
fn test_selector_through_diamond_stays_resolved() {
    let image = image();
    let registry = Registry::new();
    let mut f = Function::new(
        0x3000,
        Architecture::Aarch64,
        vec![
            Instruction::If {
                condition: Expr::reg("x2"),
                then_target: 1,
                else_target: 3,
            },
            set("x1", load(0x1900)),
            Instruction::Goto { target: 4 },
            set("x1", load(0x1900)),
            set("x16", load(MSG_SEND_SLOT)),
            Instruction::Call {
                outputs: vec!["x0".into()],
                dest: Expr::reg("x16"),
                args: vec![Expr::reg("x0"), Expr::reg("x1")],
            },
            ret(),
        ],
    );

    let report = registry
        .process_function(SessionId(1), &image, &mut f, &Settings::default())
        .unwrap();
    assert_eq!(report.message_sends, 1);
    assert!(matches!(
        &f.instructions[5],
        Instruction::Call { dest: Expr::ConstPtr(IMP), .. }
    ));
}

#[test]
fn test_deferred_until_stub_symbol_arrives() {
    let mut image = image();
    image.add_section(sections::STUBS, 0x1e00, 0x1e20);
    let registry = Registry::new();
    let id = SessionId(2);

    let original = send(0x1900, Expr::ConstPtr(STUB));
    let mut f = original.clone();
    let report = registry
        .process_function(id, &image, &mut f, &Settings::default())
        .unwrap();
    assert!(report.deferred);
    assert_eq!(f, original);
    assert!(registry.functions_to_reanalyze(id).is_empty());

    registry.symbol_added(id, Symbol::new("_objc_msgSend", STUB, SymbolKind::ImportedFunction));
    registry.symbol_added(id, Symbol::new("_objc_release", 0x1e0c, SymbolKind::ImportedFunction));
    assert_eq!(registry.functions_to_reanalyze(id), vec![0x3000]);

    let report = registry
        .process_function(id, &image, &mut f, &Settings::default())
        .unwrap();
    assert!(!report.deferred);
    assert_eq!(report.message_sends, 1);
}

#[test]
fn test_unsupported_architecture_short_circuits() {
    let mut image = MemoryImage::new(Architecture::X86);
    image.map_zeroed(0x1000, 0x100);
    let registry = Registry::new();
    let mut f = Function::new(0x1000, Architecture::X86, vec![Instruction::Nop]);

    assert!(registry
        .process_function(SessionId(3), &image, &mut f, &Settings::default())
        .is_none());
    assert!(registry.is_ignored(SessionId(3)));
}
