//! Integration tests for forward-mode differentiation.
//!
//! Each test parses a textual IR fixture, differentiates one function and
//! checks the shape of what was emitted.

use fwdiff::autodiff::Transcriber;
use fwdiff::core::{DiagnosticKind, DiagnosticSink, TranscribeError, TranscribeOptions};
use fwdiff::ir::{parse_module, InsertLoc, InstId, Module, Opcode, ParsedModule};

/// Builtin interfaces, keys and the float witness shared by every fixture.
const PRELUDE: &str = r#"
    %type = type_kind
    %float = float
    %int = int
    %bool = bool
    %kDiff = key [known_builtin "Differential"]
    %kDiffW = key [known_builtin "DifferentialWitness"]
    %kZero = key [known_builtin "dzero"]
    %zeroTy = func_type(%float)
    %IDiff = interface [known_builtin "IDifferentiable"] {
      interface_req(%kDiff, %type)
      interface_req(%kDiffW, %wtt)
      interface_req(%kZero, %zeroTy)
    }
    %wtt = witness_table_type(%IDiff)
    %fzero = func : %zeroTy [name_hint "float_zero"] {
      block {
        %z = float_lit 0.0 : %float
        ret(%z)
      }
    }
    %wFloat = witness_table(%float) : %wtt {
      entry(%kDiff, %float)
      entry(%kDiffW, %wFloat)
      entry(%kZero, %fzero)
    }
    %pairF = diff_pair(%float, %wFloat)
    %fty = func_type(%float, %float)
    %scratch = func : %fty {
      %sb = block {
      }
    }
"#;

fn parse(body: &str) -> ParsedModule {
    let _ = env_logger::builder().is_test(true).try_init();
    let source = format!("{PRELUDE}\n{body}");
    parse_module(&source).unwrap_or_else(|e| panic!("Failed to parse fixture: {e}"))
}

fn label(parsed: &ParsedModule, name: &str) -> InstId {
    parsed
        .get(name)
        .unwrap_or_else(|| panic!("fixture has no label %{name}"))
}

/// Helper to check if output contains expected patterns
fn check_output_contains(output: &str, patterns: &[&str]) {
    for pattern in patterns {
        assert!(
            output.contains(pattern),
            "Output missing expected pattern: '{pattern}'\nFull output:\n{output}"
        );
    }
}

fn ops_in(m: &Module, block: InstId) -> Vec<Opcode> {
    m.ordinary_insts(block).iter().map(|&i| m.op(i)).collect()
}

fn last_inst(m: &Module, block: InstId) -> InstId {
    *m.children(block).last().expect("empty block")
}

const SQUARE: &str = r#"
    %f = func : %fty [name_hint "f", fwd_differentiable] {
      block {
        %x = param : %float [name_hint "x"]
        %sq = mul(%x, %x) : %float
        ret(%sq)
      }
    }
"#;

#[test]
fn test_scalar_function_signature() {
    let mut parsed = parse(SQUARE);
    let f = label(&parsed, "f");
    let pair_f = label(&parsed, "pairF");
    let mut sink = DiagnosticSink::new();

    let (primal, diff) =
        fwdiff::differentiate(&mut parsed.module, f, &TranscribeOptions::default(), &mut sink).unwrap();
    let diff = diff.expect("f is differentiable");
    let m = &parsed.module;

    assert_eq!(primal, f);
    assert_eq!(m.op(diff), Opcode::Func);
    assert_eq!(m.name_hint(diff), Some("s_fwd_f"));
    assert!(m.has_decoration(diff, Opcode::ForwardDifferentiable));

    let diff_ty = m.ty(diff).unwrap();
    assert_eq!(m.op(diff_ty), Opcode::FuncType);
    assert_eq!(m.operands(diff_ty), &[pair_f, pair_f]);

    let block = m.first_block(diff).unwrap();
    let params = m.params(block);
    assert_eq!(params.len(), 1);
    assert_eq!(m.ty(params[0]), Some(pair_f));

    // The derivative is placed next to the original.
    let globals = m.children(m.root());
    let pos = |id| globals.iter().position(|&g| g == id).unwrap();
    assert!(pos(diff) < pos(f));
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

#[test]
fn test_product_rule() {
    let mut parsed = parse(SQUARE);
    let f = label(&parsed, "f");
    let mut sink = DiagnosticSink::new();
    let (_, diff) =
        fwdiff::differentiate(&mut parsed.module, f, &TranscribeOptions::default(), &mut sink).unwrap();
    let m = &parsed.module;
    let block = m.first_block(diff.unwrap()).unwrap();

    assert_eq!(
        ops_in(m, block),
        vec![
            Opcode::GetPrimal,
            Opcode::GetDiff,
            Opcode::Mul,
            Opcode::Mul,
            Opcode::Mul,
            Opcode::Add,
            Opcode::MakeDiffPair,
            Opcode::Return,
        ]
    );

    let ret = last_inst(m, block);
    let pair = m.operand(ret, 0).unwrap();
    assert_eq!(m.op(pair), Opcode::MakeDiffPair);
    let sum = m.operand(pair, 1).unwrap();
    assert_eq!(m.op(sum), Opcode::Add);
    assert!(m.operands(sum).iter().all(|&t| m.op(t) == Opcode::Mul));
    assert!(m.has_decoration(sum, Opcode::DifferentialInst));
    assert!(m.has_decoration(ret, Opcode::MixedDifferentialInst));
}

#[test]
fn test_name_hints_are_propagated() {
    let mut parsed = parse(SQUARE);
    let f = label(&parsed, "f");
    let mut sink = DiagnosticSink::new();
    let (_, diff) =
        fwdiff::differentiate(&mut parsed.module, f, &TranscribeOptions::default(), &mut sink).unwrap();
    let m = &parsed.module;
    let block = m.first_block(diff.unwrap()).unwrap();
    let insts = m.ordinary_insts(block);

    assert_eq!(m.name_hint(insts[0]), Some("x"));
    assert_eq!(m.name_hint(insts[1]), Some("s_diff_x"));
    assert!(m.has_decoration(insts[0], Opcode::PrimalInst));
    assert!(m.has_decoration(insts[1], Opcode::DifferentialInst));
}

#[test]
fn test_custom_prefixes() {
    let mut parsed = parse(SQUARE);
    let f = label(&parsed, "f");
    let options = TranscribeOptions {
        diff_name_prefix: "d_".to_string(),
        func_name_prefix: "fwd_".to_string(),
    };
    let mut sink = DiagnosticSink::new();
    let (_, diff) = fwdiff::differentiate(&mut parsed.module, f, &options, &mut sink).unwrap();
    let m = &parsed.module;
    let diff = diff.unwrap();

    assert_eq!(m.name_hint(diff), Some("fwd_f"));
    let block = m.first_block(diff).unwrap();
    assert_eq!(m.name_hint(m.ordinary_insts(block)[1]), Some("d_x"));
}

#[test]
fn test_transcription_is_memoized() {
    let mut parsed = parse(SQUARE);
    let f = label(&parsed, "f");
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);

    let first = t.transcribe_function(f).unwrap();
    let size = t.module().len();
    let second = t.transcribe_function(f).unwrap();

    assert_eq!(first, second);
    assert_eq!(t.module().len(), size);
}

#[test]
fn test_primal_is_registered_before_differential() {
    let mut parsed = parse(SQUARE);
    let f = label(&parsed, "f");
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    t.transcribe_function(f).unwrap();

    let maps = t.mapping();
    let keys: Vec<InstId> = maps.differential_keys().collect();
    assert!(!keys.is_empty());
    for key in keys {
        let primal = maps.primal_order(key).unwrap_or_else(|| panic!("{key} has no primal"));
        let diff = maps.differential_order(key).unwrap();
        assert!(primal < diff, "{key}: primal registered after differential");
    }
}

#[test]
fn test_non_differentiable_field_access() {
    let mut parsed = parse(
        r#"
        %k = key
        %S = struct [name_hint "S"] {
          field(%k, %float)
        }
        %gty = func_type(%float, %S, %float)
        %g = func : %gty [fwd_differentiable] {
          block {
            %s = param : %S
            %y = param : %float
            %v = get_field(%s, %k) : %float
            %r = add(%v, %y) : %float
            ret(%r)
          }
        }
        "#,
    );
    let g = label(&parsed, "g");
    let v = label(&parsed, "v");
    let s_ty = label(&parsed, "S");
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    let (_, diff) = t.transcribe_function(g).unwrap();

    let primal = t.mapping().lookup_primal(v, None).unwrap();
    assert_eq!(t.module().op(primal), Opcode::GetField);
    assert!(t.mapping().has_differential(v));
    assert_eq!(t.mapping().lookup_differential(v, None), None);

    // The struct parameter stays a plain parameter.
    let m = t.module();
    let diff_ty = m.ty(diff.unwrap()).unwrap();
    assert_eq!(m.func_type_params(diff_ty)[0], s_ty);
    drop(t);
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

const SHAPE: &str = r#"
    %kArea = key
    %areaTy = func_type(%float, %float)
    %IShape = interface {
      interface_req(%kArea, %areaTy)
    }
    %shapeW = witness_table_type(%IShape)
    %area = func : %areaTy {
      block {
        %a = param : %float
        ret(%a)
      }
    }
    %wSq = witness_table(%float) : %shapeW {
      entry(%kArea, %area)
    }
    %h = func : %fty [fwd_differentiable] {
      block {
        %x = param : %float
        %method = lookup_witness(%wSq, %kArea) : %areaTy
        %c = call(%method, %x) : %float
        ret(%c)
      }
    }
"#;

#[test]
fn test_interface_call_without_derivative() {
    let mut parsed = parse(SHAPE);
    let h = label(&parsed, "h");
    let method = label(&parsed, "method");
    let c = label(&parsed, "c");
    let fzero = label(&parsed, "fzero");
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    let (_, diff) = t.transcribe_function(h).unwrap();

    assert_eq!(t.mapping().lookup_differential(method, None), None);
    assert_eq!(t.mapping().lookup_differential(c, None), None);
    let primal_call = t.mapping().lookup_primal(c, None).unwrap();
    let m = t.module();
    assert_eq!(m.op(primal_call), Opcode::Call);

    // The result has no differential, so a zero is returned alongside it.
    let block = m.first_block(diff.unwrap()).unwrap();
    let pair = m.operand(last_inst(m, block), 0).unwrap();
    let zero = m.operand(pair, 1).unwrap();
    assert_eq!(m.op(zero), Opcode::Call);
    assert_eq!(m.operand(zero, 0), Some(fzero));
    drop(t);
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

#[test]
fn test_interface_call_through_derivative_requirement() {
    let source = SHAPE
        .replace("%kArea = key", "%kArea = key [derivative_req(%kDArea)]\n    %kDArea = key")
        .replace(
            "interface_req(%kArea, %areaTy)",
            "interface_req(%kArea, %areaTy)\n      interface_req(%kDArea, %dAreaTy)",
        )
        .replace("%shapeW =", "%dAreaTy = func_type(%pairF, %pairF)\n    %shapeW =");
    let mut parsed = parse(&source);
    let h = label(&parsed, "h");
    let method = label(&parsed, "method");
    let w_sq = label(&parsed, "wSq");
    let k_darea = label(&parsed, "kDArea");
    let d_area_ty = label(&parsed, "dAreaTy");
    let pair_f = label(&parsed, "pairF");
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    t.transcribe_function(h).unwrap();

    let d_method = t.mapping().lookup_differential(method, None).unwrap();
    let m = t.module();
    assert_eq!(m.op(d_method), Opcode::LookupWitness);
    assert_eq!(m.operands(d_method), &[w_sq, k_darea]);
    assert_eq!(m.ty(d_method), Some(d_area_ty));

    let call = m
        .uses(d_method)
        .iter()
        .copied()
        .find(|&u| m.op(u) == Opcode::Call)
        .expect("derivative is called");
    assert_eq!(m.ty(call), Some(pair_f));
    let arg = m.operand(call, 1).unwrap();
    assert_eq!(m.op(arg), Opcode::MakeDiffPair);
}

#[test]
fn test_generic_without_differentiable_inner_function() {
    let mut parsed = parse(
        r#"
        %G = generic [name_hint "G"] {
          block {
            %T = param : %type
            %inner = func : %fty {
              block {
                %x = param : %float
                ret(%x)
              }
            }
            ret(%inner)
          }
        }
        "#,
    );
    let generic = label(&parsed, "G");
    let x = label(&parsed, "x");
    let size = parsed.module.len();
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);

    let result = t.transcribe_function(generic).unwrap();
    assert_eq!(result, (generic, None));
    assert!(!t.mapping().has_primal(x));
    assert_eq!(t.module().len(), size);
}

#[test]
fn test_generic_function_with_dictionary() {
    let mut parsed = parse(
        r#"
        %G = generic [name_hint "G"] {
          block {
            %T = param : %type
            %w = param : %wtt
            %tfty = func_type(%T, %T)
            %inner = func : %tfty [fwd_differentiable, diff_type_entry(%T, %w)] {
              block {
                %x = param : %T
                %y = mul(%x, %x) : %T
                ret(%y)
              }
            }
            ret(%inner)
          }
        }
        "#,
    );
    let generic = label(&parsed, "G");
    let t_param = label(&parsed, "T");
    let w_param = label(&parsed, "w");
    let k_diff = label(&parsed, "kDiff");
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);

    let (primal, diff) = t.transcribe_function(generic).unwrap();
    assert_eq!(primal, generic);
    let diff_generic = diff.unwrap();
    let new_t = t.mapping().lookup_primal(t_param, None).unwrap();
    let new_w = t.mapping().lookup_primal(w_param, None).unwrap();

    let m = t.module();
    assert_eq!(m.op(diff_generic), Opcode::Generic);
    assert_eq!(m.name_hint(diff_generic), Some("s_fwd_G"));
    let diff_body = m.first_block(diff_generic).unwrap();
    assert_eq!(m.params(diff_body), vec![new_t, new_w]);

    let diff_inner = m.return_value(diff_generic).unwrap();
    assert_eq!(m.op(diff_inner), Opcode::Func);
    assert!(m.is_child_of(diff_inner, diff_generic));

    let inner_block = m.first_block(diff_inner).unwrap();
    let pair_param = m.params(inner_block)[0];
    let pair_ty = m.ty(pair_param).unwrap();
    assert_eq!(m.op(pair_ty), Opcode::DiffPairType);
    assert_eq!(m.operands(pair_ty), &[new_t, new_w]);

    // The differential type of T is only known through the witness parameter.
    let get_diff = m
        .ordinary_insts(inner_block)
        .into_iter()
        .find(|&i| m.op(i) == Opcode::GetDiff)
        .unwrap();
    let diff_t = m.ty(get_diff).unwrap();
    assert_eq!(m.op(diff_t), Opcode::LookupWitness);
    assert_eq!(m.operands(diff_t), &[new_w, k_diff]);
    drop(t);
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

#[test]
fn test_derivative_only_helpers_are_skipped() {
    let mut parsed = parse(
        r#"
        %G = generic {
          block {
            %T = param : %type
            %helper = func : %fty {
              block {
                %hx = param : %float
                ret(%hx)
              }
            }
            %dfn = specialize(%helper, %T) : %fty
            %inner = func : %fty [fwd_differentiable, fwd_derivative(%dfn)] {
              block {
                %x = param : %float
                ret(%x)
              }
            }
            ret(%inner)
          }
        }
        "#,
    );
    let generic = label(&parsed, "G");
    let dfn = label(&parsed, "dfn");
    let helper = label(&parsed, "helper");
    let inner = label(&parsed, "inner");
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    t.transcribe_function(generic).unwrap();

    assert!(!t.mapping().has_primal(dfn));
    assert!(!t.mapping().has_differential(helper));
    assert!(t.mapping().has_differential(inner));
}

#[test]
fn test_zero_of_array() {
    let mut parsed = parse(
        r#"
        %four = int_lit 4 : %int
        %arr = array(%float, %four)
        "#,
    );
    let arr = label(&parsed, "arr");
    let float = label(&parsed, "float");
    let fzero = label(&parsed, "fzero");
    let at = InsertLoc::Into(label(&parsed, "sb"));
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);

    let diff_ty = t.differentiate_type(at, arr).unwrap();
    assert_eq!(diff_ty, Some(arr));

    let zero = t.zero_of(at, arr).unwrap().unwrap();
    let m = t.module();
    assert_eq!(m.op(zero), Opcode::MakeArrayFromElement);
    assert_eq!(m.ty(zero), diff_ty);
    let element = m.operand(zero, 0).unwrap();
    assert_eq!(m.op(element), Opcode::Call);
    assert_eq!(m.operand(element, 0), Some(fzero));
    assert_eq!(m.ty(element), Some(float));
}

#[test]
fn test_zero_values_by_kind() {
    let mut parsed = parse(
        r#"
        %IShape = interface [inherits(%IDiff)]
        "#,
    );
    let int = label(&parsed, "int");
    let bool_ty = label(&parsed, "bool");
    let float = label(&parsed, "float");
    let i_shape = label(&parsed, "IShape");
    let i_diff = label(&parsed, "IDiff");
    let at = InsertLoc::Into(label(&parsed, "sb"));
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);

    let float_zero = t.zero_of(at, float).unwrap().unwrap();
    let diff_float = t.differentiate_type(at, float).unwrap();
    assert_eq!(t.module().ty(float_zero), diff_float);

    let int_zero = t.zero_of(at, int).unwrap().unwrap();
    assert_eq!(t.module().int_value(int_zero), Some(0));

    let existential = t.zero_of(at, i_shape).unwrap().unwrap();
    let m = t.module();
    assert_eq!(m.op(existential), Opcode::MakeExistential);
    assert_eq!(m.ty(existential), Some(i_diff));
    assert_eq!(m.op(m.operand(existential, 0).unwrap()), Opcode::NullDifferential);

    assert_eq!(t.zero_of(at, bool_ty).unwrap(), None);
    drop(t);
    assert_eq!(sink.count(DiagnosticKind::InternalError), 1);
}

#[test]
fn test_pair_type_requires_witness() {
    let mut parsed = parse(
        r#"
        %S = struct
        "#,
    );
    let s_ty = label(&parsed, "S");
    let float = label(&parsed, "float");
    let pair_f = label(&parsed, "pairF");
    let at = InsertLoc::Into(label(&parsed, "sb"));
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);

    assert_eq!(t.diff_pair_type(at, float), Ok(pair_f));
    assert_eq!(
        t.diff_pair_type(at, s_ty),
        Err(TranscribeError::MissingWitness { ty: s_ty })
    );
    assert_eq!(t.try_diff_pair_type(at, s_ty), Ok(None));
}

#[test]
fn test_recursive_call_uses_own_derivative() {
    let mut parsed = parse(
        r#"
        %rec = func : %fty [fwd_differentiable] {
          block {
            %x = param : %float
            %c = call(%rec, %x) : %float
            ret(%c)
          }
        }
        "#,
    );
    let rec = label(&parsed, "rec");
    let pair_f = label(&parsed, "pairF");
    let mut sink = DiagnosticSink::new();
    let (_, diff) =
        fwdiff::differentiate(&mut parsed.module, rec, &TranscribeOptions::default(), &mut sink).unwrap();
    let diff = diff.unwrap();
    let m = &parsed.module;

    let block = m.first_block(diff).unwrap();
    let call = m
        .ordinary_insts(block)
        .into_iter()
        .find(|&i| m.op(i) == Opcode::Call)
        .unwrap();
    assert_eq!(m.operand(call, 0), Some(diff));
    assert_eq!(m.ty(call), Some(pair_f));
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

#[test]
fn test_user_derivative_is_called() {
    let mut parsed = parse(
        r#"
        %dty = func_type(%pairF, %pairF)
        %dsin = func : %dty {
          block {
            %p = param : %pairF
            ret(%p)
          }
        }
        %sin = func : %fty [fwd_derivative(%dsin)] {
          block {
            %a = param : %float
            ret(%a)
          }
        }
        %k = func : %fty [fwd_differentiable] {
          block {
            %x = param : %float
            %c = call(%sin, %x) : %float
            ret(%c)
          }
        }
        "#,
    );
    let k = label(&parsed, "k");
    let sin = label(&parsed, "sin");
    let dsin = label(&parsed, "dsin");
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    t.transcribe_function(k).unwrap();

    // The user-provided derivative is called instead of transcribing sin.
    assert!(!t.mapping().has_differential(sin));
    let m = t.module();
    assert!(m.uses(dsin).iter().any(|&u| m.op(u) == Opcode::Call));
}

#[test]
fn test_non_differentiable_intrinsic_is_reported() {
    let mut parsed = parse(
        r#"
        %bad = func : %fty [fwd_differentiable] {
          block {
            %x = param : %float
            %i = intrinsic "sin"(%x) : %float
            ret(%i)
          }
        }
        "#,
    );
    let bad = label(&parsed, "bad");
    let i = label(&parsed, "i");
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    let (_, diff) = t.transcribe_function(bad).unwrap();

    // The primal program stays whole.
    assert!(diff.is_some());
    let primal = t.mapping().lookup_primal(i, None).unwrap();
    assert_eq!(t.module().op(primal), Opcode::Intrinsic);
    drop(t);
    assert_eq!(sink.count(DiagnosticKind::CannotDifferentiate), 1);
    check_output_contains(&sink.diagnostics()[0].to_string(), &["error", "intrinsic"]);
}

#[test]
fn test_no_diff_intrinsic_is_silent() {
    let mut parsed = parse(
        r#"
        %ok = func : %fty [fwd_differentiable] {
          block {
            %x = param : %float
            %i = intrinsic "floor"(%x) : %float [no_diff]
            ret(%i)
          }
        }
        "#,
    );
    let ok = label(&parsed, "ok");
    let mut sink = DiagnosticSink::new();
    fwdiff::differentiate(&mut parsed.module, ok, &TranscribeOptions::default(), &mut sink).unwrap();
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

#[test]
fn test_block_parameters_get_differentials() {
    let mut parsed = parse(
        r#"
        %loop = func : %fty [fwd_differentiable] {
          %b0 = block {
            %x = param : %float
            br(%b1, %x)
          }
          %b1 = block {
            %p = param : %float
            ret(%p)
          }
        }
        "#,
    );
    let func = label(&parsed, "loop");
    let mut sink = DiagnosticSink::new();
    let (_, diff) =
        fwdiff::differentiate(&mut parsed.module, func, &TranscribeOptions::default(), &mut sink).unwrap();
    let m = &parsed.module;
    let blocks = m.blocks(diff.unwrap());
    assert_eq!(blocks.len(), 2);

    let branch = last_inst(m, blocks[0]);
    assert_eq!(m.op(branch), Opcode::Branch);
    assert_eq!(m.operand(branch, 0), Some(blocks[1]));
    assert_eq!(m.operands(branch).len(), 3);

    let params = m.params(blocks[1]);
    assert_eq!(params.len(), 2);
    assert!(m.has_decoration(params[1], Opcode::DifferentialInst));
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

#[test]
fn test_memory_operations() {
    let mut parsed = parse(
        r#"
        %pf = ptr(%float)
        %mem = func : %fty [fwd_differentiable] {
          block {
            %x = param : %float
            %v = var : %pf
            store(%v, %x)
            %l = load(%v) : %float
            ret(%l)
          }
        }
        "#,
    );
    let func = label(&parsed, "mem");
    let v = label(&parsed, "v");
    let l = label(&parsed, "l");
    let pf = label(&parsed, "pf");
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    t.transcribe_function(func).unwrap();

    let d_var = t.mapping().lookup_differential(v, None).unwrap();
    let d_load = t.mapping().lookup_differential(l, None).unwrap();
    let m = t.module();
    assert_eq!(m.op(d_var), Opcode::Var);
    assert_eq!(m.ty(d_var), Some(pf));
    assert_eq!(m.op(d_load), Opcode::Load);
    assert_eq!(m.operand(d_load, 0), Some(d_var));
    assert!(m.uses(d_var).iter().any(|&u| m.op(u) == Opcode::Store));
}

#[test]
fn test_differentiated_module_prints_and_parses_back() {
    let mut parsed = parse(SQUARE);
    let f = label(&parsed, "f");
    let mut sink = DiagnosticSink::new();
    fwdiff::differentiate(&mut parsed.module, f, &TranscribeOptions::default(), &mut sink).unwrap();

    let printed = parsed.module.to_string();
    check_output_contains(
        &printed,
        &[
            "name_hint \"s_fwd_f\"",
            "fwd_differentiable",
            "get_primal",
            "get_diff",
            "make_pair",
            "name_hint \"s_diff_x\"",
        ],
    );
    let reparsed = parse_module(&printed).unwrap();
    assert_eq!(reparsed.module.len(), parsed.module.len());
    assert!(reparsed.module.find_named("s_fwd_f").is_some());
}

/// A type whose differential is a different type, and which has no zero.
const VEC: &str = r#"
    %Vec = struct [name_hint "Vec"]
    %DVec = struct [name_hint "DVec"]
    %wDVec = witness_table(%DVec) : %wtt {
      entry(%kDiff, %DVec)
      entry(%kDiffW, %wDVec)
    }
    %wVec = witness_table(%Vec) : %wtt {
      entry(%kDiff, %DVec)
      entry(%kDiffW, %wDVec)
    }
"#;

fn parse_with_vec(body: &str) -> ParsedModule {
    parse(&format!("{VEC}\n{body}"))
}

#[test]
fn test_compound_types_differentiate_structurally() {
    let mut parsed = parse_with_vec(
        r#"
        %pv = ptr(%Vec)
        %pi = ptr(%int)
        %tv = tuple(%Vec, %int)
        %ov = optional(%Vec)
        %pairV = diff_pair(%Vec, %wVec)
        "#,
    );
    let [dvec, wdvec, pv, pi, tv, ov, pair_v] =
        ["DVec", "wDVec", "pv", "pi", "tv", "ov", "pairV"].map(|l| label(&parsed, l));
    let at = InsertLoc::Into(label(&parsed, "sb"));
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);

    // Pointers re-wrap the differential of their pointee.
    let d_pv = t.differentiate_type(at, pv).unwrap().unwrap();
    assert_eq!(t.module().op(d_pv), Opcode::PtrType);
    assert_eq!(t.module().operands(d_pv), &[dvec]);
    assert_eq!(t.differentiate_type(at, pi), Ok(None));

    // Non-differentiable tuple members become void.
    let d_tv = t.differentiate_type(at, tv).unwrap().unwrap();
    let m = t.module();
    assert_eq!(m.op(d_tv), Opcode::TupleType);
    assert_eq!(m.operand(d_tv, 0), Some(dvec));
    assert_eq!(m.op(m.operand(d_tv, 1).unwrap()), Opcode::VoidType);

    let d_ov = t.differentiate_type(at, ov).unwrap().unwrap();
    assert_eq!(t.module().op(d_ov), Opcode::OptionalType);
    assert_eq!(t.module().operands(d_ov), &[dvec]);

    // A pair differentiates to the pair of its differential.
    let d_pair = t.differentiate_type(at, pair_v).unwrap().unwrap();
    assert_eq!(t.module().op(d_pair), Opcode::DiffPairType);
    assert_eq!(t.module().operands(d_pair), &[dvec, wdvec]);
    drop(t);
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

#[test]
fn test_scalar_pair_of_pairs_is_stable() {
    let mut parsed = parse("");
    let pair_f = label(&parsed, "pairF");
    let at = InsertLoc::Into(label(&parsed, "sb"));
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);

    assert_eq!(t.differentiate_type(at, pair_f), Ok(Some(pair_f)));
}

#[test]
fn test_associated_type_is_unexpected() {
    let mut parsed = parse(
        r#"
        %A = assoc_type
        "#,
    );
    let assoc = label(&parsed, "A");
    let at = InsertLoc::Into(label(&parsed, "sb"));
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);

    assert!(matches!(
        t.differentiate_type(at, assoc),
        Err(TranscribeError::Unexpected { inst, .. }) if inst == assoc
    ));
}

#[test]
fn test_cyclic_operands_are_reentrant() {
    let mut parsed = parse(
        r#"
        %cyc = func : %fty [fwd_differentiable] {
          block {
            %x = param : %float
            %a = neg(%b) : %float
            %b = neg(%a) : %float
            ret(%x)
          }
        }
        "#,
    );
    let cyc = label(&parsed, "cyc");
    let a = label(&parsed, "a");
    let mut sink = DiagnosticSink::new();

    let result = fwdiff::differentiate(&mut parsed.module, cyc, &TranscribeOptions::default(), &mut sink);
    assert_eq!(result, Err(TranscribeError::Reentrant { inst: a }));
}

const INOUT: &str = r#"
    %void = void
    %iof = inout(%float)
    %gty = func_type(%void, %iof)
    %g = func : %gty [fwd_differentiable] {
      block {
        %p = param : %iof [name_hint "p"]
        %l = load(%p) : %float
        %m = mul(%l, %l) : %float
        store(%p, %m)
        ret
      }
    }
"#;

#[test]
fn test_inout_parameter_carries_derivative() {
    let mut parsed = parse(INOUT);
    let [g, p, l, iof, pair_f] = ["g", "p", "l", "iof", "pairF"].map(|n| label(&parsed, n));
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    let (_, diff) = t.transcribe_function(g).unwrap();

    let d_p = t.mapping().lookup_differential(p, None).expect("p has a differential");
    let d_l = t.mapping().lookup_differential(l, None).expect("load has a differential");
    let m = t.module();

    let diff_ty = m.ty(diff.unwrap()).unwrap();
    let pass_ty = m.func_type_params(diff_ty)[0];
    assert_eq!(m.op(pass_ty), Opcode::InOutType);
    assert_eq!(m.operands(pass_ty), &[pair_f]);

    assert_eq!(m.op(d_p), Opcode::GetDiff);
    assert_eq!(m.ty(d_p), Some(iof));
    assert_eq!(m.op(d_l), Opcode::Load);
    assert_eq!(m.operand(d_l, 0), Some(d_p));
    assert!(m.uses(d_p).iter().any(|&u| m.op(u) == Opcode::Store));
    drop(t);
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

#[test]
fn test_pointer_argument_goes_through_pair_slot() {
    let mut parsed = parse(&format!(
        "{INOUT}\n{}",
        r#"
        %h = func : %fty [fwd_differentiable] {
          block {
            %x = param : %float
            %v = var : %iof
            store(%v, %x)
            %c = call(%g, %v) : %void
            %r = load(%v) : %float
            ret(%r)
          }
        }
        "#
    ));
    let [h, v, c, pair_f] = ["h", "v", "c", "pairF"].map(|n| label(&parsed, n));
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    t.transcribe_function(h).unwrap();

    let d_var = t.mapping().lookup_differential(v, None).unwrap();
    let call = t.mapping().lookup_primal(c, None).unwrap();
    let m = t.module();
    assert_eq!(m.op(call), Opcode::Call);
    let slot = m.operand(call, 1).unwrap();
    assert_eq!(m.op(slot), Opcode::Var);
    let slot_ty = m.ty(slot).unwrap();
    assert_eq!(m.op(slot_ty), Opcode::InOutType);
    assert_eq!(m.operands(slot_ty), &[pair_f]);

    // The callee's writes come back into the differential variable.
    let written_back = m.uses(d_var).iter().any(|&u| {
        m.op(u) == Opcode::Store
            && m.operand(u, 1).is_some_and(|value| {
                m.op(value) == Opcode::GetDiff
                    && m.operand(value, 0).is_some_and(|pair| m.op(pair) == Opcode::Load)
            })
    });
    assert!(written_back);
    drop(t);
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

#[test]
fn test_struct_construction_is_differentiated() {
    let mut parsed = parse(
        r#"
        %k = key [derivative_member(%dk)]
        %dk = key
        %DS = struct [name_hint "DS"] {
          field(%dk, %float)
        }
        %S = struct [name_hint "S"] {
          field(%k, %float)
        }
        %wS = witness_table(%S) : %wtt {
          entry(%kDiff, %DS)
        }
        %sf = func : %fty [fwd_differentiable] {
          block {
            %x = param : %float
            %s = make_struct(%x) : %S
            %v = get_field(%s, %k) : %float
            ret(%v)
          }
        }
        "#,
    );
    let [sf, x, s, v, ds, dk] = ["sf", "x", "s", "v", "DS", "dk"].map(|n| label(&parsed, n));
    let mut sink = DiagnosticSink::new();
    let mut t = Transcriber::new(&mut parsed.module, &mut sink);
    t.transcribe_function(sf).unwrap();

    let dx = t.mapping().lookup_differential(x, None).unwrap();
    let d_s = t.mapping().lookup_differential(s, None).expect("struct has a differential");
    let d_v = t.mapping().lookup_differential(v, None).expect("field has a differential");
    let m = t.module();
    assert_eq!(m.op(d_s), Opcode::MakeStruct);
    assert_eq!(m.ty(d_s), Some(ds));
    assert_eq!(m.operands(d_s), &[dx]);
    assert_eq!(m.op(d_v), Opcode::GetField);
    assert_eq!(m.operands(d_v), &[d_s, dk]);
    drop(t);
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
}

#[test]
fn test_branch_without_argument_differential_stays_primal() {
    let mut parsed = parse_with_vec(
        r#"
        %vty = func_type(%Vec, %float)
        %jump = func : %vty [fwd_differentiable] {
          %b0 = block {
            %x = param : %float
            %c = make_struct : %Vec
            br(%b1, %c)
          }
          %b1 = block {
            %q = param : %Vec
            ret(%q)
          }
        }
        "#,
    );
    let func = label(&parsed, "jump");
    let mut sink = DiagnosticSink::new();
    let (_, diff) =
        fwdiff::differentiate(&mut parsed.module, func, &TranscribeOptions::default(), &mut sink).unwrap();
    let m = &parsed.module;
    let blocks = m.blocks(diff.unwrap());

    // Vec has no zero, so the branch passes primal arguments only.
    let branch = last_inst(m, blocks[0]);
    assert_eq!(m.op(branch), Opcode::Branch);
    assert_eq!(m.operand(branch, 0), Some(blocks[1]));
    assert_eq!(m.operands(branch).len(), 2);
    assert!(m.has_decoration(branch, Opcode::PrimalInst));
    assert_eq!(sink.count(DiagnosticKind::InternalError), 1);
}
