// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use tempfile::tempdir;

use pf_pyramid::{
    FeatureMap, FuserConfig, FusionError, FusionMode, PyramidFuser, UpsampleMode,
};

fn sample_pyramid(config: &FuserConfig, batch: usize, seed: u64) -> Vec<FeatureMap> {
    config
        .shapes_in_stages
        .iter()
        .zip(config.channels_in_stages.iter())
        .enumerate()
        .map(|(level, (shape, &channels))| {
            FeatureMap::random_normal(batch, channels, shape, 0.0, 1.0, Some(seed + level as u64))
                .unwrap()
        })
        .collect()
}

fn small_config() -> FuserConfig {
    FuserConfig {
        num_layers: 2,
        shapes_in_stages: vec![vec![16, 16], vec![8, 8], vec![4, 4]],
        channels_in_stages: vec![8, 16, 32],
        ..FuserConfig::default()
    }
}

#[test]
fn fuser_returns_the_configured_pyramid() {
    let config = FuserConfig {
        num_layers: 2,
        shapes_in_stages: vec![vec![64, 64], vec![32, 32], vec![16, 16]],
        channels_in_stages: vec![64, 128, 256],
        ..FuserConfig::default()
    };
    let fuser = PyramidFuser::new(config.clone()).unwrap();
    let pyramid = sample_pyramid(&config, 1, 31);
    let outputs = fuser.forward(&pyramid).unwrap();
    assert_eq!(outputs.len(), 3);
    for (level, map) in outputs.iter().enumerate() {
        assert_eq!(map.channels(), config.channels_in_stages[level]);
        assert_eq!(map.shape(), config.shapes_in_stages[level].as_slice());
        for value in map.tensor().data() {
            assert!(value.is_finite());
        }
    }
}

#[test]
fn repeated_evaluation_is_bit_identical() {
    let config = small_config();
    let fuser = PyramidFuser::new(config.clone()).unwrap();
    let pyramid = sample_pyramid(&config, 2, 7);
    let first = fuser.forward(&pyramid).unwrap();
    let second = fuser.forward(&pyramid).unwrap();
    assert_eq!(first, second);
}

#[test]
fn every_norm_mode_evaluates() {
    for mode in [
        FusionMode::FastNorm,
        FusionMode::Softmax,
        FusionMode::ChannelFastNorm,
        FusionMode::ChannelSoftmax,
    ] {
        let config = FuserConfig {
            norm_mode: mode,
            ..small_config()
        };
        let fuser = PyramidFuser::new(config.clone()).unwrap();
        let pyramid = sample_pyramid(&config, 1, 13);
        let outputs = fuser.forward(&pyramid).unwrap();
        for map in &outputs {
            for value in map.tensor().data() {
                assert!(value.is_finite(), "non-finite output under {mode:?}");
            }
        }
    }
}

#[test]
fn batch_norm_stack_runs_in_both_modes() {
    let config = FuserConfig {
        use_batch_norm: true,
        use_bias: true,
        upsample_mode: UpsampleMode::Bilinear,
        ..small_config()
    };
    let fuser = PyramidFuser::new(config.clone()).unwrap();
    let pyramid = sample_pyramid(&config, 2, 17);
    let trained = fuser.forward(&pyramid).unwrap();
    fuser.set_training(false);
    let evaluated = fuser.forward(&pyramid).unwrap();
    for map in trained.iter().chain(evaluated.iter()) {
        for value in map.tensor().data() {
            assert!(value.is_finite());
        }
    }
}

#[test]
fn wrong_level_shapes_surface_the_offending_level() {
    let config = small_config();
    let fuser = PyramidFuser::new(config.clone()).unwrap();
    let mut pyramid = sample_pyramid(&config, 1, 23);
    pyramid[2] = FeatureMap::random_normal(1, 32, &[8, 4], 0.0, 1.0, Some(99)).unwrap();
    match fuser.forward(&pyramid) {
        Err(FusionError::ShapeMismatch { level, .. }) => assert_eq!(level, 2),
        other => panic!("expected a shape mismatch, got {other:?}"),
    }
}

#[test]
fn state_dict_round_trips_through_json_and_bincode() {
    let config = small_config();
    let fuser = PyramidFuser::new(config.clone()).unwrap();
    let dir = tempdir().unwrap();

    let json_path = dir.path().join("fuser.json");
    fuser.save_json(&json_path).unwrap();
    let mut restored = PyramidFuser::new(config.clone()).unwrap();
    restored.load_json(&json_path).unwrap();
    assert_eq!(
        fuser.state_dict().unwrap(),
        restored.state_dict().unwrap()
    );

    let bin_path = dir.path().join("fuser.bin");
    fuser.save_bincode(&bin_path).unwrap();
    let mut restored = PyramidFuser::new(config).unwrap();
    restored.load_bincode(&bin_path).unwrap();
    assert_eq!(
        fuser.state_dict().unwrap(),
        restored.state_dict().unwrap()
    );
}

#[test]
fn restored_parameters_reproduce_outputs() {
    let config = small_config();
    let fuser = PyramidFuser::new(config.clone()).unwrap();
    let pyramid = sample_pyramid(&config, 1, 41);
    let expected = fuser.forward(&pyramid).unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("fuser.bin");
    fuser.save_bincode(&path).unwrap();
    let mut restored = PyramidFuser::new(config).unwrap();
    restored.load_bincode(&path).unwrap();
    let observed = restored.forward(&pyramid).unwrap();
    assert_eq!(expected, observed);
}

#[test]
fn one_dimensional_pyramids_are_supported() {
    let config = FuserConfig {
        num_layers: 1,
        shapes_in_stages: vec![vec![32], vec![16], vec![8]],
        channels_in_stages: vec![4, 8, 16],
        dimension: 1,
        upsample_mode: UpsampleMode::Linear,
        ..FuserConfig::default()
    };
    let fuser = PyramidFuser::new(config.clone()).unwrap();
    let pyramid = sample_pyramid(&config, 2, 53);
    let outputs = fuser.forward(&pyramid).unwrap();
    assert_eq!(outputs.len(), 3);
    for (level, map) in outputs.iter().enumerate() {
        assert_eq!(map.shape(), config.shapes_in_stages[level].as_slice());
    }
}

#[test]
fn three_dimensional_pyramids_are_supported() {
    let config = FuserConfig {
        num_layers: 1,
        shapes_in_stages: vec![vec![8, 8, 8], vec![4, 4, 4]],
        channels_in_stages: vec![2, 4],
        dimension: 3,
        upsample_mode: UpsampleMode::Trilinear,
        ..FuserConfig::default()
    };
    let fuser = PyramidFuser::new(config.clone()).unwrap();
    let pyramid = sample_pyramid(&config, 1, 61);
    let outputs = fuser.forward(&pyramid).unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].shape(), &[8, 8, 8]);
    assert_eq!(outputs[1].shape(), &[4, 4, 4]);
}
