//! Rhai-backed pattern sandbox.
//!
//! A pattern's source is the body of a function: it runs with `t`, `dt`, `x`,
//! `y`, `z` and `prev_state` in scope and its final expression is the color,
//! built with `hsv(h, s, v)` / `rgb(r, g, b)` or given as a plain `[h, s, v]`
//! array.
//!
//! The engine is created raw with only the core, math and array packages, and
//! every helper a pattern may call is registered here. This is a best-effort
//! sandbox and not a security boundary: the operation and depth limits bound
//! runaway scripts, but a hostile script can still burn its whole operation
//! budget on every pixel.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

use rhai::packages::{BasicArrayPackage, BasicMathPackage, CorePackage, Package};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Scope, AST, FLOAT};

use super::{
    Compiled, Diagnostics, EvaluationError, Pattern, PatternArgs, PatternCompiler, PatternOutput,
    PixelState,
};
use crate::color::{self, ColorMode};
use crate::palette::{default_palettes, PaletteTable, DEFAULT_PALETTE_ID};

/// Operation budget of a single pattern evaluation.
pub const MAX_OPERATIONS: u64 = 50_000;

const ARGUMENT_NAMES: &[&str] = &["t", "dt", "x", "y", "z", "prev_state"];

const HELPER_NAMES: &[&str] = &[
    "hsv",
    "rgb",
    "palette",
    "palette_mirrored",
    "palette_length",
    "wave_pulse",
    "wave_triangle",
    "wave_sine",
    "wave_cubic",
    "plasma_sines",
    "plasma_sines_octave",
    "perlin_noise_3d",
    "fbm_noise_3d",
    "blackbody_to_rgb",
    "blackbody_correction_rgb",
    "hsv_to_rgb",
    "impulse_exp",
    "clamp",
    "fract",
    "random",
];

const KEYWORDS: &[&str] = &[
    "let", "const", "if", "else", "switch", "do", "while", "until", "loop", "for", "in", "break",
    "continue", "return", "throw", "try", "catch", "fn", "private", "true", "false", "this", "is",
    "global", "Fn", "call", "curry", "type_of", "print", "debug", "is_def_var", "is_def_fn",
];

/// Functions provided by the packages the sandbox engine loads.
const PACKAGE_NAMES: &[&str] = &[
    "sin", "cos", "tan", "sinh", "cosh", "tanh", "asin", "acos", "atan", "asinh", "acosh",
    "atanh", "hypot", "sqrt", "exp", "ln", "log", "floor", "ceiling", "round", "int", "fraction",
    "abs", "sign", "min", "max", "to_int", "to_float", "to_degrees", "to_radians", "is_nan",
    "is_finite", "is_infinite", "is_zero", "is_odd", "is_even", "PI", "E", "parse_int",
    "parse_float", "range", "len", "push", "pop", "shift", "insert", "append", "clear",
    "truncate", "reverse", "contains", "index_of", "map", "filter", "reduce", "some", "all",
    "sort", "splice", "extract", "dedup", "is_empty", "get", "set", "zip", "drain", "retain",
];

thread_local! {
    // The palette of the group currently being evaluated on this thread.
    static BOUND_PALETTE: RefCell<Option<Arc<PaletteTable>>> = const { RefCell::new(None) };
}

fn bind_palette(table: &Arc<PaletteTable>) {
    BOUND_PALETTE.with(|slot| {
        let mut slot = slot.borrow_mut();
        if !slot.as_ref().is_some_and(|bound| Arc::ptr_eq(bound, table)) {
            *slot = Some(Arc::clone(table));
        }
    });
}

fn with_palette<R>(f: impl FnOnce(&PaletteTable) -> R) -> RhaiResult<R> {
    BOUND_PALETTE.with(|slot| match slot.borrow().as_deref() {
        Some(table) => Ok(f(table)),
        None => Err("no palette is bound to this evaluation".into()),
    })
}

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Color returned by `hsv(...)` / `rgb(...)` inside a script.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternColor {
    pub color: [f64; 3],
    pub mode: ColorMode,
}

fn number(value: &Dynamic) -> RhaiResult<FLOAT> {
    if let Ok(v) = value.as_float() {
        return Ok(v);
    }
    if let Ok(v) = value.as_int() {
        return Ok(v as FLOAT);
    }
    Err(format!("expected a number, found {}", value.type_name()).into())
}

fn triple(values: &[Dynamic]) -> RhaiResult<[f64; 3]> {
    match values {
        [a, b, c] => Ok([number(a)?, number(b)?, number(c)?]),
        other => Err(format!("expected 3 components, found {}", other.len()).into()),
    }
}

fn to_array(color: [f64; 3]) -> Array {
    color.iter().map(|c| Dynamic::from_float(*c)).collect()
}

fn octaves(value: &Dynamic) -> RhaiResult<u32> {
    Ok(number(value)?.max(0.0) as u32)
}

fn register_helpers(engine: &mut Engine) {
    engine.register_type_with_name::<PatternColor>("Color");
    engine.register_fn("hsv", |h: Dynamic, s: Dynamic, v: Dynamic| -> RhaiResult<PatternColor> {
        Ok(PatternColor {
            color: [number(&h)?, number(&s)?, number(&v)?],
            mode: ColorMode::Hsv,
        })
    });
    engine.register_fn("hsv", |c: Array| -> RhaiResult<PatternColor> {
        Ok(PatternColor {
            color: triple(&c)?,
            mode: ColorMode::Hsv,
        })
    });
    engine.register_fn("rgb", |r: Dynamic, g: Dynamic, b: Dynamic| -> RhaiResult<PatternColor> {
        Ok(PatternColor {
            color: [number(&r)?, number(&g)?, number(&b)?],
            mode: ColorMode::Rgb,
        })
    });
    engine.register_fn("rgb", |c: Array| -> RhaiResult<PatternColor> {
        Ok(PatternColor {
            color: triple(&c)?,
            mode: ColorMode::Rgb,
        })
    });

    engine.register_fn("palette", |t: Dynamic| -> RhaiResult<Array> {
        let t = number(&t)?;
        with_palette(|table| to_array(table.get_color(t)))
    });
    engine.register_fn("palette_mirrored", |t: Dynamic| -> RhaiResult<Array> {
        let t = number(&t)?;
        with_palette(|table| to_array(table.get_color_mirrored(t)))
    });
    engine.register_fn("palette_length", || -> RhaiResult<rhai::INT> {
        with_palette(|table| table.control_points() as rhai::INT)
    });

    engine.register_fn("wave_pulse", |t: Dynamic, duty: Dynamic| -> RhaiResult<FLOAT> {
        Ok(color::wave_pulse(number(&t)?, number(&duty)?))
    });
    engine.register_fn("wave_triangle", |t: Dynamic| -> RhaiResult<FLOAT> {
        Ok(color::wave_triangle(number(&t)?))
    });
    engine.register_fn("wave_sine", |t: Dynamic| -> RhaiResult<FLOAT> {
        Ok(color::wave_sine(number(&t)?))
    });
    engine.register_fn("wave_cubic", |t: Dynamic| -> RhaiResult<FLOAT> {
        Ok(color::wave_cubic(number(&t)?))
    });
    engine.register_fn(
        "plasma_sines",
        |x: Dynamic,
         y: Dynamic,
         t: Dynamic,
         cx: Dynamic,
         cy: Dynamic,
         cxy: Dynamic,
         cr: Dynamic|
         -> RhaiResult<FLOAT> {
            Ok(color::plasma_sines(
                number(&x)?,
                number(&y)?,
                number(&t)?,
                number(&cx)?,
                number(&cy)?,
                number(&cxy)?,
                number(&cr)?,
            ))
        },
    );
    engine.register_fn(
        "plasma_sines_octave",
        |x: Dynamic, y: Dynamic, t: Dynamic, n: Dynamic, lac: Dynamic, pers: Dynamic| -> RhaiResult<FLOAT> {
            Ok(color::plasma_sines_octave(
                number(&x)?,
                number(&y)?,
                number(&t)?,
                octaves(&n)?,
                number(&lac)?,
                number(&pers)?,
            ))
        },
    );
    engine.register_fn("perlin_noise_3d", |x: Dynamic, y: Dynamic, z: Dynamic| -> RhaiResult<FLOAT> {
        Ok(color::perlin_noise_3d(number(&x)?, number(&y)?, number(&z)?))
    });
    engine.register_fn(
        "fbm_noise_3d",
        |x: Dynamic, y: Dynamic, z: Dynamic, n: Dynamic, lac: Dynamic, pers: Dynamic| -> RhaiResult<FLOAT> {
            Ok(color::fbm_noise_3d(
                number(&x)?,
                number(&y)?,
                number(&z)?,
                octaves(&n)?,
                number(&lac)?,
                number(&pers)?,
            ))
        },
    );

    engine.register_fn("blackbody_to_rgb", |kelvin: Dynamic| -> RhaiResult<Array> {
        Ok(to_array(color::blackbody_to_rgb(number(&kelvin)?)))
    });
    engine.register_fn(
        "blackbody_correction_rgb",
        |rgb: Array, kelvin: Dynamic| -> RhaiResult<Array> {
            Ok(to_array(color::blackbody_correction_rgb(
                triple(&rgb)?,
                number(&kelvin)?,
            )))
        },
    );
    engine.register_fn("hsv_to_rgb", |h: Dynamic, s: Dynamic, v: Dynamic| -> RhaiResult<Array> {
        Ok(to_array(color::hsv_to_rgb(number(&h)?, number(&s)?, number(&v)?)))
    });
    engine.register_fn("impulse_exp", |k: Dynamic, x: Dynamic| -> RhaiResult<FLOAT> {
        Ok(color::impulse_exp(number(&k)?, number(&x)?))
    });
    engine.register_fn("clamp", |v: Dynamic, min: Dynamic, max: Dynamic| -> RhaiResult<FLOAT> {
        Ok(color::clamp(number(&v)?, number(&min)?, number(&max)?))
    });
    engine.register_fn("fract", |v: Dynamic| -> RhaiResult<FLOAT> {
        Ok(color::fract(number(&v)?))
    });
    // uniform in [0, 1); no seeding or ranges are exposed
    engine.register_fn("random", || -> FLOAT { rand::random::<FLOAT>() });
}

fn build_engine() -> Engine {
    let mut engine = Engine::new_raw();
    engine.register_global_module(CorePackage::new().as_shared_module());
    engine.register_global_module(BasicMathPackage::new().as_shared_module());
    engine.register_global_module(BasicArrayPackage::new().as_shared_module());

    engine.disable_symbol("eval");
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_call_levels(32);
    engine.set_max_expr_depths(64, 32);
    engine.set_max_string_size(1_024);
    engine.set_max_array_size(1_024);
    engine.set_max_map_size(256);

    engine.on_print(|text| tracing::debug!(target: "ledcontrol::pattern", "{text}"));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: "ledcontrol::pattern", ?source, ?pos, "{text}")
    });

    register_helpers(&mut engine);
    engine
}

/// A compiled script together with the engine that runs it.
pub struct ScriptPattern {
    engine: Arc<Engine>,
    ast: AST,
}

impl ScriptPattern {
    fn output(value: Dynamic) -> Result<PatternOutput, EvaluationError> {
        let type_name = value.type_name();
        let color = if value.is::<PatternColor>() {
            value.try_cast::<PatternColor>()
        } else {
            value
                .try_cast::<Array>()
                .and_then(|values| triple(&values).ok())
                .map(|color| PatternColor {
                    color,
                    mode: ColorMode::Hsv,
                })
        };
        let PatternColor { color, mode } =
            color.ok_or_else(|| EvaluationError::InvalidOutput(type_name.to_string()))?;
        Ok(PatternOutput {
            color,
            mode,
            state: PixelState::from_color(color),
        })
    }
}

impl Pattern for ScriptPattern {
    fn evaluate(&self, args: &PatternArgs<'_>) -> Result<PatternOutput, EvaluationError> {
        bind_palette(args.palette);
        let mut scope = Scope::new();
        scope
            .push("t", args.t)
            .push("dt", args.dt)
            .push("x", args.x)
            .push("y", args.y)
            .push("z", args.z)
            .push_dynamic("prev_state", args.prev.as_dynamic().clone());

        let value = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|err| EvaluationError::Script(err.to_string()))?;
        Self::output(value)
    }
}

/// [`PatternCompiler`] producing [`ScriptPattern`]s from a shared engine.
pub struct ScriptCompiler {
    engine: Arc<Engine>,
    warmup_palette: Arc<PaletteTable>,
}

impl Default for ScriptCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptCompiler {
    pub fn new() -> Self {
        let spectrum = default_palettes()
            .remove(&DEFAULT_PALETTE_ID)
            .map(|palette| PaletteTable::build(&palette));
        Self {
            engine: Arc::new(build_engine()),
            warmup_palette: Arc::new(spectrum.unwrap_or_else(|| {
                PaletteTable::build(&crate::palette::Palette::new(
                    "Spectrum",
                    vec![[0.0, 1.0, 1.0], [1.0, 1.0, 1.0]],
                ))
            })),
        }
    }
}

impl PatternCompiler for ScriptCompiler {
    fn compile(&self, source: &str) -> Result<Compiled, Diagnostics> {
        let mut warnings: Vec<String> = undefined_names(source)
            .into_iter()
            .map(|name| format!("undefined name '{name}'"))
            .collect();

        let ast = match self.engine.compile(source) {
            Ok(ast) => ast,
            Err(err) => {
                return Err(Diagnostics {
                    errors: vec![err.to_string()],
                    warnings,
                })
            }
        };

        let pattern = ScriptPattern {
            engine: Arc::clone(&self.engine),
            ast,
        };
        let zero = PixelState::zero();
        let warmup = PatternArgs {
            t: 0.0,
            dt: 0.1,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            prev: &zero,
            palette: &self.warmup_palette,
        };
        if let Err(err) = pattern.evaluate(&warmup) {
            warnings.push(format!("warm-up call failed: {err}"));
        }

        Ok(Compiled {
            pattern: Arc::new(pattern),
            warnings,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Ident(&'a str),
    Punct(u8),
}

fn tokenize(source: &str) -> Vec<Token<'_>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i += 2;
            while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                i += 1;
            }
            i += 2;
        } else if matches!(b, b'"' | b'\'' | b'`') {
            i += 1;
            while i < bytes.len() && bytes[i] != b {
                if bytes[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
        } else if b.is_ascii_digit() {
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric()
                    || bytes[i] == b'_'
                    || (bytes[i] == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)))
            {
                i += 1;
            }
        } else if b.is_ascii_alphabetic() || b == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(Token::Ident(&source[start..i]));
        } else {
            if b.is_ascii_punctuation() {
                tokens.push(Token::Punct(b));
            }
            i += 1;
        }
    }
    tokens
}

fn declared_names<'a>(tokens: &[Token<'a>]) -> HashSet<&'a str> {
    let mut declared = HashSet::new();
    for (idx, token) in tokens.iter().enumerate() {
        match token {
            Token::Ident("let" | "const") => {
                if let Some(Token::Ident(name)) = tokens.get(idx + 1) {
                    declared.insert(*name);
                }
            }
            Token::Ident("fn") => {
                if let Some(Token::Ident(name)) = tokens.get(idx + 1) {
                    declared.insert(*name);
                }
                // parameters
                for token in tokens.iter().skip(idx + 3) {
                    match token {
                        Token::Punct(b')') => break,
                        Token::Ident(name) => {
                            declared.insert(*name);
                        }
                        Token::Punct(_) => {}
                    }
                }
            }
            Token::Ident("for") => {
                for token in tokens.iter().skip(idx + 1) {
                    match token {
                        Token::Ident("in") => break,
                        Token::Ident(name) => {
                            declared.insert(*name);
                        }
                        Token::Punct(_) => {}
                    }
                }
            }
            Token::Ident("catch") => {
                if let Some(Token::Ident(name)) = tokens.get(idx + 2) {
                    declared.insert(*name);
                }
            }
            _ => {}
        }
    }
    declared
}

/// Identifiers in `source` that nothing in the sandbox defines, in order of
/// first use.
///
/// A lexical scan only: method names after `.`, map keys and names bound with
/// `let`, `const`, `for`, `fn` or `catch` anywhere in the source are accepted.
pub fn undefined_names(source: &str) -> Vec<String> {
    let tokens = tokenize(source);
    let declared = declared_names(&tokens);
    let mut unknown: Vec<String> = Vec::new();

    for (idx, token) in tokens.iter().enumerate() {
        let Token::Ident(name) = *token else {
            continue;
        };
        let after_dot = idx > 0 && tokens[idx - 1] == Token::Punct(b'.');
        let map_key = tokens.get(idx + 1) == Some(&Token::Punct(b':'))
            && tokens.get(idx + 2) != Some(&Token::Punct(b':'));
        let known = ARGUMENT_NAMES.contains(&name)
            || HELPER_NAMES.contains(&name)
            || KEYWORDS.contains(&name)
            || PACKAGE_NAMES.contains(&name)
            || declared.contains(name);
        if after_dot || map_key || known || unknown.iter().any(|n| n == name) {
            continue;
        }
        unknown.push(name.to_string());
    }
    unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::Palette;
    use crate::pattern::builtin::default_patterns;

    fn spectrum() -> Arc<PaletteTable> {
        Arc::new(PaletteTable::build(&default_palettes()[&DEFAULT_PALETTE_ID]))
    }

    fn run(source: &str, x: f64, palette: &Arc<PaletteTable>) -> Result<PatternOutput, EvaluationError> {
        let compiled = ScriptCompiler::new()
            .compile(source)
            .unwrap_or_else(|d| panic!("compile failed: {:?}", d.errors));
        let prev = PixelState::zero();
        compiled.pattern.evaluate(&PatternArgs {
            t: 0.0,
            dt: 0.0,
            x,
            y: 0.0,
            z: 0.0,
            prev: &prev,
            palette,
        })
    }

    #[test]
    fn palette_lookup_follows_position() {
        let out = run("palette(x)", 0.5, &spectrum()).unwrap();
        assert_eq!(out.mode, ColorMode::Hsv);
        assert!((out.color[0] - 0.5).abs() <= 0.001);
        assert_eq!(out.color[1], 1.0);
    }

    #[test]
    fn palette_binding_follows_the_group() {
        let red = Arc::new(PaletteTable::build(&Palette::new(
            "red",
            vec![[0.0, 1.0, 1.0], [0.0, 1.0, 1.0]],
        )));
        let blue = Arc::new(PaletteTable::build(&Palette::new(
            "blue",
            vec![[0.66, 1.0, 1.0], [0.66, 1.0, 1.0]],
        )));
        assert_eq!(run("palette(x)", 0.3, &red).unwrap().color[0], 0.0);
        assert_eq!(run("palette(x)", 0.3, &blue).unwrap().color[0], 0.66);
        let length = run("hsv(0, 0, palette_length())", 0.0, &blue).unwrap();
        assert_eq!(length.color[2], 2.0);
    }

    #[test]
    fn rgb_constructor_sets_mode_and_accepts_integers() {
        let out = run("rgb(1, 0.5, 0)", 0.0, &spectrum()).unwrap();
        assert_eq!(out.mode, ColorMode::Rgb);
        assert_eq!(out.color, [1.0, 0.5, 0.0]);
    }

    #[test]
    fn state_carries_the_last_color() {
        let palette = spectrum();
        let compiled = ScriptCompiler::new()
            .compile("let v = prev_state[2] + 0.25; hsv(0.0, 0.0, v)")
            .unwrap_or_else(|d| panic!("{:?}", d.errors));
        let mut state = PixelState::zero();
        for _ in 0..3 {
            let out = compiled
                .pattern
                .evaluate(&PatternArgs {
                    t: 0.0,
                    dt: 0.0,
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                    prev: &state,
                    palette: &palette,
                })
                .unwrap();
            state = out.state;
        }
        let value = state.as_dynamic().clone().try_cast::<Array>().unwrap();
        assert_eq!(value[2].as_float().unwrap(), 0.75);
    }

    #[test]
    fn syntax_errors_are_reported() {
        let err = ScriptCompiler::new()
            .compile("hsv(x, 1.0, ")
            .err()
            .expect("should not compile");
        assert!(!err.errors.is_empty());
    }

    #[test]
    fn unknown_names_warn_without_blocking() {
        let compiled = ScriptCompiler::new()
            .compile("hsv(foo + x, 1.0, 1.0)")
            .unwrap_or_else(|d| panic!("{:?}", d.errors));
        assert_eq!(compiled.warnings[0], "undefined name 'foo'");
        // the warm-up call trips over the same name
        assert!(compiled.warnings.len() >= 2);
    }

    #[test]
    fn scanner_accepts_locals_methods_and_comments() {
        let source = r#"
            // unknown_in_comment
            let a = x.abs() * 2.0;
            for i in range(0, 3) { a += i; }
            fn shift(v, by) { v + by }
            let label = "not_a_name";
            hsv(shift(a, 0.1), sin(t), 1.0)
        "#;
        assert!(undefined_names(source).is_empty(), "{:?}", undefined_names(source));
        assert_eq!(undefined_names("math_stuff(x) + y2"), vec!["math_stuff", "y2"]);
    }

    #[test]
    fn runaway_loops_are_cut_off() {
        let compiled = ScriptCompiler::new()
            .compile("loop { }")
            .unwrap_or_else(|d| panic!("{:?}", d.errors));
        assert!(compiled
            .warnings
            .iter()
            .any(|w| w.starts_with("warm-up call failed")));
    }

    #[test]
    fn non_color_results_are_rejected() {
        let err = run("\"text\"", 0.0, &spectrum()).unwrap_err();
        assert!(matches!(err, EvaluationError::InvalidOutput(_)));
    }

    #[test]
    fn eval_is_not_available() {
        match ScriptCompiler::new().compile("eval(\"hsv(0, 0, 1)\")") {
            Err(diagnostics) => assert!(!diagnostics.errors.is_empty()),
            Ok(compiled) => assert!(!compiled.warnings.is_empty()),
        }
    }

    #[test]
    fn every_builtin_compiles_cleanly() {
        let compiler = ScriptCompiler::new();
        for (id, definition) in default_patterns() {
            match compiler.compile(&definition.source) {
                Ok(compiled) => assert!(
                    compiled.warnings.is_empty(),
                    "pattern {id}: {:?}",
                    compiled.warnings
                ),
                Err(diagnostics) => panic!("pattern {id}: {:?}", diagnostics.errors),
            }
        }
    }
}
