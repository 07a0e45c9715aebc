//! End-to-end scenarios against a real GGUF model.
//!
//! Point `TUTTI_MODEL_GGUF` at a small chat model and run with
//! `cargo test -- --ignored`.

use tutti::{ContextConfig, GenerateParams, generate, generate_parallel, load_model, new_context};

fn model_path() -> String {
    std::env::var("TUTTI_MODEL_GGUF").expect("set TUTTI_MODEL_GGUF to a local .gguf file")
}

fn deterministic_params() -> GenerateParams {
    GenerateParams {
        max_tokens: 16,
        temperature: 0.0,
        seed: 42,
        ..GenerateParams::default()
    }
}

#[test]
#[ignore = "needs TUTTI_MODEL_GGUF pointing at a local model"]
fn single_prompt_is_reproducible() {
    let (backend, model) = load_model(&model_path()).unwrap();
    let config = ContextConfig::default();
    let params = GenerateParams {
        max_tokens: 4,
        ..deterministic_params()
    };

    let mut ctx = new_context(&backend, &model, &config).unwrap();
    let first = generate(&mut ctx, "Hello, world.", &params).unwrap();
    let second = generate(&mut ctx, "Hello, world.", &params).unwrap();
    assert_eq!(first, second);
}

#[test]
#[ignore = "needs TUTTI_MODEL_GGUF pointing at a local model"]
fn one_element_batch_matches_the_single_prompt_path() {
    let (backend, model) = load_model(&model_path()).unwrap();
    let config = ContextConfig::default();
    let params = deterministic_params();

    let mut ctx = new_context(&backend, &model, &config).unwrap();
    let single = generate(&mut ctx, "The capital of France is", &params).unwrap();
    let batch =
        generate_parallel(&mut ctx, &["The capital of France is".to_string()], &params).unwrap();
    assert_eq!(batch, vec![single]);
}

#[test]
#[ignore = "needs TUTTI_MODEL_GGUF pointing at a local model"]
fn shared_preamble_does_not_perturb_outputs() {
    let (backend, model) = load_model(&model_path()).unwrap();
    let config = ContextConfig::default();
    let params = deterministic_params();

    let preamble = "You are a terse assistant. Answer in one short sentence.\n\n";
    let prompts: Vec<String> = ["What is rust?", "Name a prime.", "What color is the sky?"]
        .iter()
        .map(|q| format!("{preamble}{q}"))
        .collect();

    let mut ctx = new_context(&backend, &model, &config).unwrap();
    let together = generate_parallel(&mut ctx, &prompts, &params).unwrap();

    // Prefix sharing is purely an optimisation: each prompt decoded alone
    // must come out identical.
    for (prompt, expected) in prompts.iter().zip(&together) {
        let alone = generate(&mut ctx, prompt, &params).unwrap();
        assert_eq!(&alone, expected);
    }
}

#[test]
#[ignore = "needs TUTTI_MODEL_GGUF pointing at a local model"]
fn identical_prompts_share_everything_and_agree() {
    let (backend, model) = load_model(&model_path()).unwrap();
    let config = ContextConfig::default();
    let params = deterministic_params();

    let prompts = vec!["Count to three.".to_string(); 4];
    let mut ctx = new_context(&backend, &model, &config).unwrap();
    let results = generate_parallel(&mut ctx, &prompts, &params).unwrap();

    assert_eq!(results.len(), 4);
    for r in &results[1..] {
        assert_eq!(r, &results[0]);
    }
}

#[test]
#[ignore = "needs TUTTI_MODEL_GGUF pointing at a local model"]
fn oversized_prompt_fails_alone() {
    let (backend, model) = load_model(&model_path()).unwrap();
    let config = ContextConfig {
        n_ctx: Some(512),
        ..ContextConfig::default()
    };
    let params = deterministic_params();

    let huge = "word ".repeat(2_000);
    let prompts = vec![
        "Say hi.".to_string(),
        huge,
        "Say bye.".to_string(),
    ];

    let mut ctx = new_context(&backend, &model, &config).unwrap();
    let results = generate_parallel(&mut ctx, &prompts, &params).unwrap();

    assert_eq!(results.len(), 3);
    assert!(!results[0].starts_with("[ERROR]"));
    assert!(results[1].starts_with("[ERROR]"));
    assert!(results[1].contains("512"));
    assert!(!results[2].starts_with("[ERROR]"));
}

#[test]
#[ignore = "needs TUTTI_MODEL_GGUF pointing at a local model"]
fn zero_budget_yields_empty_responses() {
    let (backend, model) = load_model(&model_path()).unwrap();
    let config = ContextConfig::default();
    let params = GenerateParams {
        max_tokens: 0,
        ..deterministic_params()
    };

    let prompts = vec!["One.".to_string(), "Two.".to_string()];
    let mut ctx = new_context(&backend, &model, &config).unwrap();
    let results = generate_parallel(&mut ctx, &prompts, &params).unwrap();
    assert_eq!(results, vec![String::new(), String::new()]);
}

#[test]
#[ignore = "needs TUTTI_MODEL_GGUF pointing at a local model"]
fn more_prompts_than_slots_all_complete_in_order() {
    let (backend, model) = load_model(&model_path()).unwrap();
    let config = ContextConfig {
        n_parallel: 2,
        ..ContextConfig::default()
    };
    let params = GenerateParams {
        n_parallel: 2,
        max_tokens: 8,
        ..deterministic_params()
    };

    let prompts: Vec<String> = (1..=5).map(|i| format!("Question {i}: why?")).collect();
    let mut ctx = new_context(&backend, &model, &config).unwrap();
    let results = generate_parallel(&mut ctx, &prompts, &params).unwrap();
    assert_eq!(results.len(), prompts.len());
}
