use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rust_icd::evaluation::{evaluate_end_to_end, evaluate_ranking, generate_examples};
use rust_icd::{
    CachingModel, ClinicalCodeRef, ClinicalCodeTree, CodeSearch, LanguageModel, OpenAiClient,
    OptimizedRankingPrompt, Settings,
};

#[derive(Parser, Debug)]
#[command(name = "rust_icd", about = "Look up ICD codes and assign them to case notes")]
struct Cli {
    /// Code hierarchy dataset (JSON)
    #[arg(long)]
    codes: PathBuf,
    /// The dataset is a flat table of {code, desc, parent} rows
    #[arg(long)]
    flat: bool,
    /// Settings file (YAML); defaults are used when absent
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show a code with its ancestors and children
    Lookup { code: String },

    /// List candidate leaf codes for a case note
    Candidates {
        #[arg(long)]
        note: String,
    },

    /// Pick the single best code for a case note
    Rank {
        #[arg(long)]
        note: String,
    },

    /// Search the tree for codes relevant to a case note
    TreeSearch {
        #[arg(long)]
        note: String,
        /// Overrides tree_search.max_depth from the settings
        #[arg(long)]
        max_depth: Option<usize>,
        /// Also rank the accepted codes
        #[arg(long)]
        rank: bool,
        /// Print the raw model reply for every explored node
        #[arg(long)]
        show_replies: bool,
    },

    /// Measure ranking accuracy on synthetic examples
    Evaluate {
        #[arg(long, default_value_t = 20)]
        examples: usize,
        #[arg(long, default_value_t = 5)]
        candidates: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Run the whole pipeline from the note instead of ranking
        /// the generated candidates
        #[arg(long)]
        end_to_end: bool,
    },
}

fn load_tree(path: &Path, flat: bool) -> anyhow::Result<ClinicalCodeTree> {
    let f = File::open(path).with_context(|| format!("opening code dataset {}", path.display()))?;
    let tree = if flat {
        ClinicalCodeTree::from_flat_reader(f)?
    } else {
        ClinicalCodeTree::from_reader(f)?
    };
    Ok(tree)
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = match path {
        Some(path) => Settings::from_path(path)
            .with_context(|| format!("reading settings {}", path.display()))?,
        None => Settings::default(),
    };
    if settings.llm.api_key.is_none() {
        settings.llm.api_key = std::env::var("OPENAI_API_KEY").ok();
    }
    Ok(settings)
}

fn make_model(settings: &Settings) -> anyhow::Result<Box<dyn LanguageModel>> {
    let client = OpenAiClient::new(&settings.llm)?;
    if settings.cache_responses {
        Ok(Box::new(CachingModel::new(client)))
    } else {
        Ok(Box::new(client))
    }
}

fn print_node(tree: &ClinicalCodeTree, code_ref: ClinicalCodeRef) {
    let node = tree.node(code_ref);
    let indent = 2 * node.depth().max(0) as usize;
    println!("{:indent$}{}: {}", "", node.code(), node.description());
}

/// Print the path from the top of the tree down to the code, then
/// its children one level further in
fn cmd_lookup(tree: &ClinicalCodeTree, code: &str) {
    let Some(code_ref) = tree.find(code) else {
        println!("{code}: not found");
        return;
    };
    for on_path in tree.parents(code_ref).into_iter().skip(1) {
        print_node(tree, on_path);
    }
    for child in tree.children(code_ref) {
        print_node(tree, *child);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let tree = Arc::new(load_tree(&cli.codes, cli.flat)?);
    tracing::info!(codes = tree.len(), leaves = tree.all_leaves().len(), "loaded code tree");

    if let Commands::Lookup { code } = &cli.command {
        cmd_lookup(&tree, code);
        return Ok(());
    }

    let settings = load_settings(cli.config.as_deref())?;
    let model = make_model(&settings)?;
    let optimized = match &settings.optimized_prompt {
        Some(path) => Some(
            OptimizedRankingPrompt::from_path(path)
                .with_context(|| format!("reading optimized prompt {}", path.display()))?,
        ),
        None => None,
    };
    let max_depth_default = settings.tree_search.max_depth;
    let mut search = CodeSearch::new(tree.clone(), model, settings);
    if let Some(optimized) = optimized {
        search = search.with_optimized_prompt(optimized);
    }

    match cli.command {
        Commands::Lookup { .. } => (),
        Commands::Candidates { note } => {
            for code in search.find_candidates(&note) {
                let description = tree.description_of(&code).unwrap_or_default();
                println!("{code}: {description}");
            }
        }
        Commands::Rank { note } => match search.rank_code(&note) {
            Some(code) => {
                let description = tree.description_of(&code).unwrap_or_default();
                println!("{code}: {description}");
            }
            None => println!("no matching code"),
        },
        Commands::TreeSearch {
            note,
            max_depth,
            rank,
            show_replies,
        } => {
            let max_depth = max_depth.unwrap_or(max_depth_default);
            let outcome = search.tree_search_outcome(&note, max_depth);
            if show_replies {
                for decision in outcome.replies() {
                    println!("--- {} (depth {}) ---", decision.code, decision.depth);
                    println!("{}", decision.reply.trim());
                }
                println!("---");
            }
            if rank {
                match search.rank_accepted(&note, &outcome) {
                    Some(code) => println!("{code}"),
                    None => println!("no matching code"),
                }
            } else {
                for code in outcome.codes(&tree) {
                    let description = tree.description_of(&code).unwrap_or_default();
                    println!("{code}: {description}");
                }
            }
        }
        Commands::Evaluate {
            examples,
            candidates,
            seed,
            end_to_end,
        } => {
            let examples = generate_examples(&tree, examples, candidates, seed);
            let report = if end_to_end {
                evaluate_end_to_end(&search, &examples)
            } else {
                evaluate_ranking(&search, &examples)
            };
            println!(
                "{}/{} correct (accuracy {:.3})",
                report.correct,
                report.total,
                report.accuracy()
            );
        }
    }

    Ok(())
}
