//! Checkpoint persistence round-trip.

use candle_core::{DType, Device, Tensor};
use thorax_core::ChestClassifier;
use thorax_trainer::{Adam, AdamConfig, CheckpointMeta, checkpoint};

#[test]
fn round_trip_reproduces_forward_outputs() {
    let device = Device::Cpu;
    let model = ChestClassifier::new(4, &device).unwrap();
    let optimizer = Adam::new(model.named_vars(), AdamConfig::default()).unwrap();

    let base = tempfile::tempdir().unwrap();
    let bundle = checkpoint::checkpoint_dir(base.path(), 1, "roundtrip");
    let meta = CheckpointMeta {
        epoch: 1,
        best_val_loss: 0.42,
        optimizer_step: 0,
    };
    checkpoint::save(&bundle, &model, &optimizer, &meta).unwrap();

    let input = Tensor::ones((1, 3, 64, 64), DType::F32, &device).unwrap();
    let before = model
        .forward_t(&input, false)
        .unwrap()
        .to_vec2::<f32>()
        .unwrap();

    // A freshly initialized model diverges until the weights are applied.
    let restored = ChestClassifier::new(4, &device).unwrap();
    let mut restored_optimizer =
        Adam::new(restored.named_vars(), AdamConfig::default()).unwrap();
    let loaded = checkpoint::load(&bundle, &restored, &mut restored_optimizer).unwrap();
    assert_eq!(loaded, meta);

    let after = restored
        .forward_t(&input, false)
        .unwrap()
        .to_vec2::<f32>()
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn loading_a_missing_bundle_fails() {
    let device = Device::Cpu;
    let model = ChestClassifier::new(2, &device).unwrap();
    let mut optimizer = Adam::new(model.named_vars(), AdamConfig::default()).unwrap();
    let base = tempfile::tempdir().unwrap();
    let missing = base.path().join("epoch_7_gone");
    assert!(checkpoint::load(&missing, &model, &mut optimizer).is_err());
}
