use burn::{
    backend::Autodiff,
    module::{AutodiffModule, Module},
    optim::{AdamWConfig, GradientsParams, Optimizer},
    record::{BinFileRecorder, FullPrecisionSettings, Recorder},
};
use burn_ndarray::NdArray;
use digitcap::{
    data::{CaptchaDataset, Normalize},
    error::{ensure_finite, CaptchaError, Result},
    metrics::{multi_head_accuracy, MultiHeadLossConfig},
    model::{ModelConfig, MultiHeadModel},
};
use std::f64::consts::PI;

type EvalBackend = NdArray;
type TrainBackend = Autodiff<EvalBackend>;

const MODEL_PATH: &str = "model/digitcap";

fn main() -> Result<()> {
    env_logger::init();

    let device = Default::default();
    let config = ModelConfig::new();

    let batch_size = 64;
    let base_lr = 1e-3;
    let num_epochs = 100;

    let dataset = CaptchaDataset::from_dir("./data", Normalize::Centered)?;
    let (dataset_train, dataset_valid) = dataset.split(0.9);

    let (train_images, train_targets) = dataset_train.into_tensors::<TrainBackend>(&device);
    let (valid_images, valid_targets) = dataset_valid.into_tensors::<EvalBackend>(&device);

    let train_len = train_images.dims()[0];
    let valid_len = valid_images.dims()[0];
    println!("Dataset sizes: Train={train_len}, Valid={valid_len}");

    let mut model = MultiHeadModel::<TrainBackend>::new(&config, &device);
    // Surface pooling-backend divergence before spending epochs on it.
    model.valid().check_pooling_consistency(&device)?;

    let loss_fn = MultiHeadLossConfig::new().init::<TrainBackend>(&device);
    let mut optim = AdamWConfig::new().with_weight_decay(1e-4).init();

    let mut best_acc = 0.0;

    for epoch in 1..=num_epochs {
        // Cosine annealing: lr = 0.5 * base * (1 + cos(pi * epoch / total))
        let lr = 0.5 * base_lr * (1.0 + (PI * epoch as f64 / num_epochs as f64).cos());

        let mut total_loss = 0.0;
        let mut batch_count = 0;

        for i in (0..train_len).step_by(batch_size) {
            let end = (i + batch_size).min(train_len);
            let images_batch = train_images.clone().slice([i..end]);
            let targets_batch = train_targets.clone().slice([i..end]);

            let logits = model.forward(images_batch);
            let output = loss_fn.forward(&logits, targets_batch);
            let loss_value = ensure_finite(output.total.clone().into_scalar(), "training loss")?;

            let grads = output.total.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(lr, model, grads);

            total_loss += loss_value as f64;
            batch_count += 1;
        }

        let avg_loss = total_loss / batch_count as f64;

        if epoch % 5 == 0 || epoch == 1 {
            let model_valid = model.valid();
            let logits = model_valid.forward(valid_images.clone());
            let report = multi_head_accuracy(&logits, valid_targets.clone());

            let slot_summary: Vec<String> = report
                .per_slot
                .iter()
                .map(|a| format!("{:.1}", a * 100.0))
                .collect();
            println!(
                "Epoch {epoch:3}/{num_epochs} - Loss: {avg_loss:.4} - Full: {:6.2}% - Slots: [{}]%",
                report.full_sequence * 100.0,
                slot_summary.join(" ")
            );

            if report.full_sequence > best_acc {
                best_acc = report.full_sequence;
                println!("New best model ({:.2}%), saving...", best_acc * 100.0);
                std::fs::create_dir_all("model")?;
                BinFileRecorder::<FullPrecisionSettings>::default()
                    .record(model.clone().into_record(), MODEL_PATH.into())
                    .map_err(|e| CaptchaError::Record(e.to_string()))?;
            }
        } else {
            println!("Epoch {epoch:3}/{num_epochs} - Loss: {avg_loss:.4}");
        }
    }

    Ok(())
}
