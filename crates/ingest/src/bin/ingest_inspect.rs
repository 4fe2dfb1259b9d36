use std::env;
use std::path::Path;

use ingest::{ContextState, ReadFrom, Step, strategy_for};
use usage_core::Family;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: ingest_inspect <codex|gemini|opencode> <path>");
        std::process::exit(2);
    }
    let Some(family) = Family::parse(&args[1]) else {
        eprintln!("unknown family {}", args[1]);
        std::process::exit(2);
    };
    let strategy = strategy_for(family);
    let path = Path::new(&args[2]);
    let location = path.display().to_string();

    let identity = strategy.extractor.read_identity(path).unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    });
    println!("identity {identity}");

    let records = strategy
        .extractor
        .records(path, &ReadFrom::default())
        .unwrap_or_else(|err| {
            eprintln!("{err}");
            std::process::exit(1);
        });
    let mut state = ContextState::default();
    let mut measurements = 0usize;
    for item in records {
        let step = item.and_then(|item| {
            let (next, step) = std::mem::take(&mut state).step(item, strategy.context, &location)?;
            state = next;
            Ok(step)
        });
        match step {
            Ok(Step::Measurement(stamped)) => {
                measurements += 1;
                match strategy.build_event(&identity, None, stamped, &location, None) {
                    Ok(event) => println!(
                        "{} {} model={} total={} input={} output={}",
                        event.position,
                        event.order,
                        event.context.model.as_deref().unwrap_or("-"),
                        event.usage.total_tokens.unwrap_or_default(),
                        event.usage.input_tokens,
                        event.usage.output_tokens,
                    ),
                    Err(err) => {
                        eprintln!("{err}");
                        std::process::exit(1);
                    }
                }
            }
            Ok(Step::Skipped(reason)) => println!("skipped {reason:?}"),
            Ok(_) => {}
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        }
    }
    println!("measurements {measurements}");
}
