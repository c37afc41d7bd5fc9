use digitcap::{CaptchaSolver, ModelConfig};
use std::env;
use std::fs;
use std::path::Path;

const MODEL_PATH: &str = "model/digitcap";

fn main() {
    env_logger::init();

    let config = ModelConfig::new();
    let solver = match CaptchaSolver::from_file(&config, Path::new(MODEL_PATH)) {
        Ok(solver) => solver,
        Err(e) => {
            eprintln!("Failed to load model from {MODEL_PATH}.bin: {e}");
            return;
        }
    };

    let args: Vec<String> = env::args().collect();
    if args.len() > 1 {
        for path in &args[1..] {
            predict_one(&solver, path);
        }
    } else {
        // Predict a few samples from the data folder
        println!("No file specified. Testing samples from ./data ...");
        let Ok(entries) = fs::read_dir("./data") else {
            println!("Warning: ./data directory not found.");
            return;
        };
        let mut count = 0;
        for entry in entries.flatten() {
            if count >= 5 {
                break;
            }
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "jpg" || e == "png") {
                predict_one(&solver, path.to_str().unwrap_or_default());
                count += 1;
            }
        }
    }
}

fn predict_one(solver: &CaptchaSolver, path: &str) {
    if path.is_empty() {
        return;
    }

    match fs::read(path) {
        Ok(image_bytes) => match solver.solve(&image_bytes) {
            Ok(prediction) => {
                let filename = Path::new(path)
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy();
                println!(
                    "File: {:<20} -> Prediction: {} (confidence {:.3})",
                    filename,
                    prediction.text,
                    prediction.mean_confidence()
                );
            }
            Err(e) => eprintln!("Error predicting {path}: {e}"),
        },
        Err(e) => eprintln!("Failed to read file {path}: {e}"),
    }
}
