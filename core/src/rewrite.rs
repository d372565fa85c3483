// rewrite.rs - Call-site rewriting
//
// Walks the SSA form of a function and edits the plain form:
//   - objc_msgSend calls with a known selector become direct calls to the
//     method implementation
//   - calls to ARC runtime functions are removed (tail calls become returns)
//   - loads of constant string literal addresses become CFSTR intrinsics
//
// Each edit replaces one instruction in place and SSA is rebuilt before the
// next instruction is looked at. Edits go to a copy that is committed only
// when the whole walk succeeds.

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::Settings;
use crate::dispatch::DispatchResolver;
use crate::il::ssa::{MemoryOracle, RegisterValue, SsaFunction, SsaRegister};
use crate::il::{Expr, Function, Instruction, Intrinsic};
use crate::image::Architecture;
use crate::model::AnalysisInfo;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("instruction index {index} out of range ({len} instructions)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("branch at {index} targets {target}, past the end of the function")]
    BranchOutOfRange { index: usize, target: usize },
}

/// Everything a rewrite consults besides the function itself.
pub struct RewriteContext<'a> {
    pub info: &'a AnalysisInfo,
    pub resolver: &'a DispatchResolver,
    pub settings: &'a Settings,
    pub memory: &'a dyn MemoryOracle,
}

/// What a rewrite changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub message_sends: usize,
    pub arc_calls_removed: usize,
    pub string_literals: usize,
    /// The function was queued for another pass once stubs are known
    pub deferred: bool,
}

impl RewriteReport {
    pub fn changed(&self) -> bool {
        self.message_sends + self.arc_calls_removed + self.string_literals > 0
    }
}

/// Replace instruction `index` of `function`.
pub fn replace_instruction(
    function: &mut Function,
    index: usize,
    instruction: Instruction,
) -> Result<(), RewriteError> {
    let len = function.instructions.len();
    let slot = function
        .instructions
        .get_mut(index)
        .ok_or(RewriteError::IndexOutOfRange { index, len })?;
    *slot = instruction;
    Ok(())
}

fn check_branches(function: &Function) -> Result<(), RewriteError> {
    let len = function.instructions.len();
    for (index, inst) in function.instructions.iter().enumerate() {
        if let Some(&target) = inst.branch_targets().iter().find(|&&t| t >= len) {
            return Err(RewriteError::BranchOutOfRange { index, target });
        }
    }
    Ok(())
}

/// Expression that returns to the caller of a function on `architecture`.
pub fn return_address(architecture: Architecture) -> Option<Expr> {
    match architecture {
        Architecture::Aarch64 => Some(Expr::reg("x30")),
        // Return address sits on top of the stack at a tail call
        Architecture::X86_64 => Some(Expr::load(Expr::reg("rsp"), 8)),
        _ => None,
    }
}

/// Rewrite every eligible call site of `function`.
///
/// On error the function is left as it was.
pub fn rewrite_function(
    function: &mut Function,
    cx: &RewriteContext<'_>,
) -> Result<RewriteReport, RewriteError> {
    check_branches(function)?;

    let mut working = function.clone();
    let mut ssa = SsaFunction::build(&working, cx.memory);
    let mut report = RewriteReport::default();

    for index in 0..ssa.instructions.len() {
        let plain = ssa.non_ssa_index(index);
        let site = CallSite {
            index,
            plain: &working.instructions[plain],
            is_last: plain + 1 == working.instructions.len(),
            function_address: working.address,
            architecture: working.architecture,
        };
        let Some(replacement) = plan(&ssa, &site, cx, &mut report) else {
            continue;
        };
        trace!("{:#x}[{}]: {} => {}", working.address, plain, working.instructions[plain], replacement);
        replace_instruction(&mut working, plain, replacement)?;
        ssa = SsaFunction::build(&working, cx.memory);
    }

    if report.changed() {
        debug!(
            "Rewrote {:#x}: {} message sends, {} ARC calls, {} string literals",
            function.address, report.message_sends, report.arc_calls_removed, report.string_literals
        );
        *function = working;
    }
    Ok(report)
}

/// Address a call goes to, if dataflow knows it.
fn call_target(value: RegisterValue) -> Option<u64> {
    match value {
        RegisterValue::Constant(a) | RegisterValue::ConstantPointer(a) | RegisterValue::ImportedAddress(a) => Some(a),
        RegisterValue::Undetermined => None,
    }
}

/// One instruction under consideration.
struct CallSite<'a> {
    /// SSA index
    index: usize,
    plain: &'a Instruction,
    /// Last instruction of the function
    is_last: bool,
    function_address: u64,
    architecture: Architecture,
}

/// Decide the replacement for the instruction at `site`, if any.
fn plan(
    ssa: &SsaFunction,
    site: &CallSite<'_>,
    cx: &RewriteContext<'_>,
    report: &mut RewriteReport,
) -> Option<Instruction> {
    let index = site.index;
    let inst = &ssa.instructions[index];

    if let Instruction::SetReg { dest, src, .. } = inst {
        let address = ssa.evaluate(src, cx.memory).constant()?;
        let literal = cx.info.string_literal_at(address)?;
        report.string_literals += 1;
        return Some(Instruction::Intrinsic {
            outputs: vec![dest.name.clone()],
            intrinsic: Intrinsic::CfStr,
            params: vec![Expr::ConstPtr(literal.data_address)],
        });
    }

    // A jump is only a tail call when it ends the function
    let eligible = match inst {
        Instruction::Call { .. } | Instruction::TailCall { .. } => true,
        Instruction::Jump { .. } => site.is_last,
        _ => false,
    };
    if !eligible {
        return None;
    }
    let target = call_target(ssa.evaluate(inst.control_target()?, cx.memory))?;

    if let Instruction::Call { args, .. } = inst {
        if cx.resolver.is_message_send(target) {
            if let Some(implementation) = message_send_target(ssa, args, cx.info) {
                report.message_sends += 1;
                return Some(with_call_destination(site.plain, implementation));
            }
        }
    }

    if cx.settings.cleanup_arc_code && cx.resolver.is_arc_function(target) {
        let replacement = match inst {
            Instruction::Call { .. } => Instruction::Nop,
            _ => Instruction::Ret {
                dest: return_address(site.architecture)?,
            },
        };
        report.arc_calls_removed += 1;
        return Some(replacement);
    }

    if cx.resolver.is_in_stub_section(target) && cx.resolver.defer_function(site.function_address) {
        report.deferred = true;
    }
    None
}

/// Implementation selected by an objc_msgSend call, when the receiver and
/// selector are plain registers and the selector is a known constant.
fn message_send_target(
    ssa: &SsaFunction,
    args: &[Expr<SsaRegister>],
    info: &AnalysisInfo,
) -> Option<u64> {
    let [Expr::Reg(_), Expr::Reg(selector), ..] = args else {
        return None;
    };
    let selector_value = ssa.value(selector).constant()?;
    let implementation = info.implementation_for_selector(selector_value);
    if implementation.is_none() {
        trace!("No implementation for selector value {:#x}", selector_value);
    }
    implementation
}

fn with_call_destination(plain: &Instruction, implementation: u64) -> Instruction {
    match plain {
        Instruction::Call { outputs, args, .. } => Instruction::Call {
            outputs: outputs.clone(),
            dest: Expr::ConstPtr(implementation),
            args: args.clone(),
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi;
    use crate::il::ssa::NoMemory;
    use crate::image::{MemoryImage, Symbol, SymbolKind};
    use crate::model::{ClassInfo, MethodInfo, MethodListInfo, SelectorRefInfo, StringLiteralInfo};

    const MSG_SEND: u64 = 0x1000;
    const RELEASE: u64 = 0x1010;
    const IMP: u64 = 0x4000;

    fn resolver() -> DispatchResolver {
        let mut image = MemoryImage::new(Architecture::Aarch64);
        image.map_zeroed(0x1000, 0x100);
        image.add_section(abi::sections::STUBS, 0x1000, 0x1100);
        image.add_symbol(Symbol::new("_objc_msgSend", MSG_SEND, SymbolKind::ImportedFunction));
        image.add_symbol(Symbol::new("_objc_release", RELEASE, SymbolKind::ImportedFunction));
        DispatchResolver::new(&image)
    }

    fn info() -> AnalysisInfo {
        let mut info = AnalysisInfo::new();
        info.add_selector_ref(SelectorRefInfo {
            address: 0x6000,
            name: "bar".into(),
            raw_selector: 0x7000,
            name_address: 0x7000,
        });
        info.add_class(ClassInfo {
            name: "Foo".into(),
            method_list: MethodListInfo {
                methods: vec![MethodInfo {
                    address: 0x5000,
                    selector: "bar".into(),
                    type_encoding: "v16@0:8".into(),
                    name_address: 0x7000,
                    type_address: 0,
                    implementation_address: IMP,
                }],
                ..Default::default()
            },
            ..Default::default()
        });
        info.add_string_literal(StringLiteralInfo {
            address: 0x8000,
            data_address: 0x8100,
            size: 4,
        });
        info
    }

    fn set(dest: &str, src: Expr) -> Instruction {
        Instruction::SetReg {
            dest: dest.into(),
            size: 8,
            src,
        }
    }

    fn msg_send_call() -> Instruction {
        Instruction::Call {
            outputs: vec!["x0".into()],
            dest: Expr::ConstPtr(MSG_SEND),
            args: vec![Expr::reg("x0"), Expr::reg("x1")],
        }
    }

    fn run(function: &mut Function, settings: &Settings) -> RewriteReport {
        let info = info();
        let resolver = resolver();
        let cx = RewriteContext {
            info: &info,
            resolver: &resolver,
            settings,
            memory: &NoMemory,
        };
        rewrite_function(function, &cx).unwrap()
    }

    #[test]
    fn test_message_send_rewritten() {
        let mut f = Function::new(
            0x3000,
            Architecture::Aarch64,
            vec![
                set("x1", Expr::ConstPtr(0x7000)),
                msg_send_call(),
                Instruction::Ret { dest: Expr::reg("x30") },
            ],
        );
        let report = run(&mut f, &Settings::default());
        assert_eq!(report.message_sends, 1);
        assert_eq!(
            f.instructions[1],
            Instruction::Call {
                outputs: vec!["x0".into()],
                dest: Expr::ConstPtr(IMP),
                args: vec![Expr::reg("x0"), Expr::reg("x1")],
            }
        );
    }

    #[test]
    fn test_unknown_selector_left_alone() {
        let original = Function::new(
            0x3000,
            Architecture::Aarch64,
            vec![
                set("x1", Expr::ConstPtr(0x9999)),
                msg_send_call(),
                Instruction::Ret { dest: Expr::reg("x30") },
            ],
        );
        let mut f = original.clone();
        let report = run(&mut f, &Settings::default());
        assert!(!report.changed());
        assert_eq!(f, original);
    }

    #[test]
    fn test_selector_must_be_register() {
        let original = Function::new(
            0x3000,
            Architecture::Aarch64,
            vec![
                Instruction::Call {
                    outputs: vec![],
                    dest: Expr::ConstPtr(MSG_SEND),
                    args: vec![Expr::reg("x0"), Expr::ConstPtr(0x7000)],
                },
                Instruction::Ret { dest: Expr::reg("x30") },
            ],
        );
        let mut f = original.clone();
        run(&mut f, &Settings::default());
        assert_eq!(f, original);
    }

    #[test]
    fn test_arc_call_becomes_nop_and_tail_call_returns() {
        let mut f = Function::new(
            0x3000,
            Architecture::Aarch64,
            vec![
                Instruction::Call {
                    outputs: vec!["x0".into()],
                    dest: Expr::ConstPtr(RELEASE),
                    args: vec![Expr::reg("x0")],
                },
                Instruction::TailCall {
                    dest: Expr::ConstPtr(RELEASE),
                    args: vec![Expr::reg("x0")],
                },
            ],
        );
        let report = run(&mut f, &Settings::default());
        assert_eq!(report.arc_calls_removed, 2);
        assert_eq!(f.instructions[0], Instruction::Nop);
        assert_eq!(f.instructions[1], Instruction::Ret { dest: Expr::reg("x30") });
    }

    #[test]
    fn test_arc_tail_jump_on_x86_64() {
        let mut f = Function::new(
            0x3000,
            Architecture::X86_64,
            vec![Instruction::Jump {
                dest: Expr::ConstPtr(RELEASE),
            }],
        );
        run(&mut f, &Settings::default());
        assert_eq!(
            f.instructions[0],
            Instruction::Ret {
                dest: Expr::load(Expr::reg("rsp"), 8)
            }
        );
    }

    #[test]
    fn test_arc_jump_inside_function_left_alone() {
        let original = Function::new(
            0x3000,
            Architecture::X86_64,
            vec![
                Instruction::If {
                    condition: Expr::reg("rcx"),
                    then_target: 1,
                    else_target: 2,
                },
                Instruction::Jump {
                    dest: Expr::ConstPtr(RELEASE),
                },
                Instruction::Ret {
                    dest: Expr::load(Expr::reg("rsp"), 8),
                },
            ],
        );
        let mut f = original.clone();
        let report = run(&mut f, &Settings::default());
        assert_eq!(f, original);
        assert_eq!(report.arc_calls_removed, 0);
        assert!(!report.deferred);
    }

    #[test]
    fn test_arc_cleanup_disabled() {
        let original = Function::new(
            0x3000,
            Architecture::Aarch64,
            vec![
                Instruction::Call {
                    outputs: vec![],
                    dest: Expr::ConstPtr(RELEASE),
                    args: vec![],
                },
                Instruction::Ret { dest: Expr::reg("x30") },
            ],
        );
        let mut f = original.clone();
        let report = run(&mut f, &Settings::default().with_arc_cleanup(false));
        assert_eq!(f, original);
        assert_eq!(report.arc_calls_removed, 0);
    }

    #[test]
    fn test_string_literal_becomes_intrinsic() {
        let mut f = Function::new(
            0x3000,
            Architecture::Aarch64,
            vec![
                set("x2", Expr::Add(Box::new(Expr::ConstPtr(0x7f00)), Box::new(Expr::Const(0x100)))),
                Instruction::Ret { dest: Expr::reg("x30") },
            ],
        );
        let report = run(&mut f, &Settings::default());
        assert_eq!(report.string_literals, 1);
        assert_eq!(
            f.instructions[0],
            Instruction::Intrinsic {
                outputs: vec!["x2".into()],
                intrinsic: Intrinsic::CfStr,
                params: vec![Expr::ConstPtr(0x8100)],
            }
        );
    }

    #[test]
    fn test_bad_branch_is_rejected_untouched() {
        let original = Function::new(
            0x3000,
            Architecture::Aarch64,
            vec![msg_send_call(), Instruction::Goto { target: 9 }],
        );
        let mut f = original.clone();
        let info = info();
        let resolver = resolver();
        let settings = Settings::default();
        let cx = RewriteContext {
            info: &info,
            resolver: &resolver,
            settings: &settings,
            memory: &NoMemory,
        };
        assert_eq!(
            rewrite_function(&mut f, &cx),
            Err(RewriteError::BranchOutOfRange { index: 1, target: 9 })
        );
        assert_eq!(f, original);
    }

    #[test]
    fn test_replace_out_of_range() {
        let mut f = Function::new(0, Architecture::Aarch64, vec![]);
        assert_eq!(
            replace_instruction(&mut f, 0, Instruction::Nop),
            Err(RewriteError::IndexOutOfRange { index: 0, len: 0 })
        );
    }
}
