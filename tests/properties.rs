//! Property-based tests for the tokenizer and native registration.
//!
//! Tests the following properties:
//! - Every token lies within the source
//! - Each contiguous run of unscannable input is recorded exactly once
//! - The pull tokenizer always makes progress and reaches `End`
//! - Well-formed registrations store exactly the declared signature
//! - Malformed registrations fail once and commit nothing

use proptest::prelude::*;
use rill::lexer::{tokenize, ScannerSet, Tokenizer};
use rill::token::TokenKind;
use rill::{CompileOptions, Mode, Session, ValueType};

// =============================================================================
// Strategies
// =============================================================================

/// A piece of source text and whether it is unscannable.
fn arb_segment() -> impl Strategy<Value = (String, bool)> {
    prop_oneof![
        prop::sample::select(vec!["a", "x1", "12", "3.5", "+", "==", "(", "}", " ", "\n", "let"])
            .prop_map(|s| (s.to_string(), false)),
        prop::sample::select(vec!["@", "$", "`", "~"]).prop_map(|s| (s.to_string(), true)),
    ]
}

fn arb_parameter_type() -> impl Strategy<Value = ValueType> {
    prop::sample::select(vec![ValueType::Bool, ValueType::Int, ValueType::Float, ValueType::String])
}

fn arb_return_type() -> impl Strategy<Value = ValueType> {
    prop::sample::select(vec![
        ValueType::Unit,
        ValueType::Bool,
        ValueType::Int,
        ValueType::Float,
        ValueType::String,
    ])
}

// =============================================================================
// Tokenizer
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn tokens_stay_within_source(source in any::<String>()) {
        let scanners = ScannerSet::language();
        let stream = tokenize(&source, &scanners);
        for token in &stream.tokens {
            prop_assert!(token.index + token.length <= source.len());
            prop_assert!(source.is_char_boundary(token.index));
        }
        for &error in &stream.errors {
            prop_assert!(error < source.len());
        }
        prop_assert_eq!(stream.tokens.last().map(|t| t.kind), Some(TokenKind::End));
    }

    #[test]
    fn error_runs_are_recorded_once(segments in prop::collection::vec(arb_segment(), 0..40)) {
        let source: String = segments.iter().map(|(s, _)| s.as_str()).collect();
        let mut runs = 0;
        let mut previous_invalid = false;
        for (_, invalid) in &segments {
            if *invalid && !previous_invalid {
                runs += 1;
            }
            previous_invalid = *invalid;
        }

        let scanners = ScannerSet::language();
        let stream = tokenize(&source, &scanners);
        prop_assert_eq!(stream.errors.len(), runs);
        for pair in stream.errors.windows(2) {
            prop_assert!(pair[0] + 1 < pair[1]);
        }
        for &error in &stream.errors {
            prop_assert!(scanners.longest_match(&source[error..]).is_none());
        }
    }

    #[test]
    fn pull_tokenizer_terminates(source in any::<String>()) {
        let scanners = ScannerSet::language();
        let mut tokenizer = Tokenizer::new(&source, &scanners);
        let mut last_index = None;
        let mut steps = 0;
        loop {
            let token = tokenizer.next_token();
            if token.kind == TokenKind::End {
                prop_assert_eq!(token.index, source.len());
                break;
            }
            prop_assert!(token.length >= 1);
            prop_assert!(last_index.map_or(true, |last| token.index > last));
            last_index = Some(token.index);
            steps += 1;
            prop_assert!(steps <= source.len());
        }
    }
}

// =============================================================================
// Native registration
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn registration_stores_declared_signature(
        parameters in prop::collection::vec(arb_parameter_type(), 0..5),
        return_type in arb_return_type(),
    ) {
        let mut session = Session::new();
        let declared = parameters.clone();
        let registered = session.add_function(
            move |def| {
                def.name("probe");
                for (i, ty) in declared.iter().enumerate() {
                    def.param_type(&format!("p{}", i), *ty)?;
                }
                def.returns_type(return_type)
            },
            |_ctx| Ok(()),
        );
        prop_assert!(registered.is_ok());

        let errors = session.compile_source("p.rill", "fn main() {}", Mode::Debug, CompileOptions::default());
        prop_assert!(errors.is_empty());

        let chunk = session.chunk();
        let native = chunk.natives.iter().find(|n| n.name == "probe");
        prop_assert!(native.is_some());
        let function_type = &chunk.function_types[native.map_or(0, |n| n.type_index)];
        prop_assert_eq!(&function_type.parameters, &parameters);
        prop_assert_eq!(function_type.return_type, return_type);
        let size: usize = parameters.iter().map(ValueType::size).sum();
        prop_assert_eq!(function_type.parameter_size, size);
    }

    #[test]
    fn malformed_registration_commits_nothing(
        parameters in prop::collection::vec(arb_parameter_type(), 0..5),
        fail_early in any::<bool>(),
    ) {
        let mut session = Session::new();
        let declared = parameters.clone();
        let registered = session.add_function(
            move |def| {
                def.name("probe");
                for (i, ty) in declared.iter().enumerate() {
                    def.param_type(&format!("p{}", i), *ty)?;
                }
                if fail_early {
                    return Err(rill::NativeError::failed("refused"));
                }
                Ok(())
            },
            |_ctx| Ok(()),
        );
        prop_assert!(registered.is_err());

        let errors = session.compile_source("p.rill", "fn main() {}", Mode::Debug, CompileOptions::default());
        prop_assert_eq!(errors.len(), 1);
        prop_assert!(session.chunk().natives.iter().all(|n| n.name != "probe"));
    }
}
