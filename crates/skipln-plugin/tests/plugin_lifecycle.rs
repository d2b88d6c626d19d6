//! End-to-end operator tests: creator → negotiate → configure → initialize →
//! enqueue → serialize → deserialize.

use half::f16;
use skipln_common::{DataType, RuntimeConfig, TensorDesc, TensorFormat, TensorMut, TensorRef};
use skipln_kernels::Stream;
use skipln_plugin::{
    DynamicPlugin, LifecycleState, Origin, PluginCreator, PluginFieldCollection, PluginFieldData,
    SkipLayerNormPluginCreator, SkipLayerNormPluginDynamic, SkipLayerNormVarSeqlenPlugin,
    SkipLayerNormVarSeqlenPluginCreator,
};

fn fields(
    type_id: i32,
    gamma: &[f32],
    beta: &[f32],
    bias: Option<&[f32]>,
) -> PluginFieldCollection {
    let mut f = PluginFieldCollection::new()
        .with("type_id", PluginFieldData::Int32(vec![type_id]))
        .with("ld", PluginFieldData::Int32(vec![gamma.len() as i32]))
        .with("gamma", PluginFieldData::Float32(gamma.to_vec()))
        .with("beta", PluginFieldData::Float32(beta.to_vec()));
    if let Some(bias) = bias {
        f = f.with("bias", PluginFieldData::Float32(bias.to_vec()));
    }
    f
}

fn fixed_plugin(
    type_id: i32,
    gamma: &[f32],
    beta: &[f32],
    bias: Option<&[f32]>,
) -> SkipLayerNormPluginDynamic {
    SkipLayerNormPluginCreator::new()
        .create("skip_ln", &fields(type_id, gamma, beta, bias))
        .unwrap()
        .with_config(RuntimeConfig::default())
}

/// Configure, initialize and run one f32 launch over `[rows, ld]`.
fn run_f32(plugin: &mut dyn DynamicPlugin, ld: usize, input: &[f32], skip: &[f32]) -> Vec<f32> {
    let rows = input.len() / ld;
    let desc = TensorDesc::new(vec![rows as i64, ld as i64], DataType::Float, TensorFormat::Linear);
    let descs = vec![desc; 3];
    let stream = Stream::host();
    plugin.configure(&descs[..2], &descs[2..]).unwrap();
    plugin.initialize(&stream).unwrap();

    let mut out = vec![0.0f32; input.len()];
    let status = plugin.enqueue(
        &descs[..2],
        &descs[2..],
        &[TensorRef::F32(input), TensorRef::F32(skip)],
        &mut [TensorMut::F32(&mut out)],
        &mut [],
        &stream,
    );
    assert!(status.is_success(), "enqueue failed with status {}", status.code());
    out
}

// ── numerics ────────────────────────────────────────────────────────────────

#[test]
fn f32_row_matches_reference_values() {
    let mut p = fixed_plugin(0, &[1.0; 4], &[0.0; 4], None);
    let out = run_f32(&mut p, 4, &[1.0, 2.0, 3.0, 4.0], &[0.0; 4]);
    let expected = [-1.3416, -0.4472, 0.4472, 1.3416];
    for (o, e) in out.iter().zip(expected) {
        assert!((o - e).abs() < 1e-4, "got {out:?}");
    }
}

#[test]
fn constant_bias_cancels_out() {
    let input = [0.3, -1.2, 2.5, 0.0, 4.0, -0.7, 1.1, 3.3];
    let skip = [1.0, 0.5, -0.5, 2.0, 0.0, 0.25, -1.0, 0.75];
    let gamma = [1.0, 0.5, 2.0, 1.5];
    let beta = [0.1, -0.1, 0.2, 0.0];

    let mut plain = fixed_plugin(0, &gamma, &beta, None);
    let mut biased = fixed_plugin(0, &gamma, &beta, Some(&[5.0; 4]));
    let a = run_f32(&mut plain, 4, &input, &skip);
    let b = run_f32(&mut biased, 4, &input, &skip);
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-4, "{a:?} vs {b:?}");
    }
}

#[test]
fn int8_path_tracks_float_reference_within_one_code() {
    let ld = 6;
    let rows = 3;
    let stride = 8;
    let (s_in, s_skip, s_out) = (0.05f32, 0.02f32, 0.03f32);
    let gamma = [1.0, 0.5, 1.5, 0.75, 1.25, 1.0];
    let beta = [0.0, 0.1, -0.1, 0.2, -0.2, 0.05];
    let bias = [0.5, -0.25, 0.0, 0.125, 0.3, -0.4];

    let mut input = vec![0i8; rows * stride];
    let mut skip = vec![0i8; rows * stride];
    for r in 0..rows {
        for c in 0..ld {
            input[r * stride + c] = (((r * 37 + c * 23) % 200) as i32 - 100) as i8;
            skip[r * stride + c] = (((r * 11 + c * 53) % 160) as i32 - 80) as i8;
        }
    }

    let mut p = fixed_plugin(2, &gamma, &beta, Some(&bias));
    let dims = vec![rows as i64, ld as i64, 1, 1];
    let int8 = |scale: f32| {
        TensorDesc::new(dims.clone(), DataType::Int8, TensorFormat::Chw4).with_scale(scale)
    };
    let (in_desc, skip_desc, out_desc) = (int8(s_in), int8(s_skip), int8(s_out));
    let inputs = [in_desc, skip_desc];
    let outputs = [out_desc];

    for pos in 0..3 {
        let io = [inputs[0].clone(), inputs[1].clone(), outputs[0].clone()];
        assert!(p.supports_format_combination(pos, &io, 2, 1).unwrap());
    }
    let stream = Stream::host();
    p.configure(&inputs, &outputs).unwrap();
    p.initialize(&stream).unwrap();
    assert_eq!(p.params().device().unwrap().param_type(), DataType::Half);

    let mut out = vec![7i8; rows * stride];
    let status = p.enqueue(
        &inputs,
        &outputs,
        &[TensorRef::I8(&input), TensorRef::I8(&skip)],
        &mut [TensorMut::I8(&mut out)],
        &mut [],
        &stream,
    );
    assert!(status.is_success());

    let h = |v: f32| f16::from_f32(v).to_f32() as f64;
    for r in 0..rows {
        let c: Vec<f64> = (0..ld)
            .map(|i| {
                input[r * stride + i] as f64 * s_in as f64
                    + skip[r * stride + i] as f64 * s_skip as f64
                    + h(bias[i])
            })
            .collect();
        let mean = c.iter().sum::<f64>() / ld as f64;
        let var = c.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / ld as f64;
        let inv = 1.0 / (var + 1e-5).sqrt();
        for i in 0..ld {
            let y = (c[i] - mean) * inv * h(gamma[i]) + h(beta[i]);
            let q = (y / s_out as f64).round().clamp(-128.0, 127.0) as i32;
            let got = out[r * stride + i] as i32;
            assert!((got - q).abs() <= 1, "row {r} ch {i}: got {got}, float path {q}");
        }
        assert_eq!(&out[r * stride + ld..(r + 1) * stride], &[0, 0], "padding lanes of row {r}");
    }
}

// ── lifecycle ───────────────────────────────────────────────────────────────

#[test]
fn reinitialize_reproduces_device_buffers() {
    let stream = Stream::host();
    let mut p = fixed_plugin(1, &[0.1, 0.2, 0.3], &[1.0, 2.0, 3.0], Some(&[-1.0, 0.0, 1.0]));
    let descs = vec![TensorDesc::new(vec![2, 3], DataType::Half, TensorFormat::Linear); 3];
    p.configure(&descs[..2], &descs[2..]).unwrap();

    p.initialize(&stream).unwrap();
    let snapshot = |p: &SkipLayerNormPluginDynamic| {
        let d = p.params().device().unwrap();
        (d.scale().to_le_bytes(), d.shift().to_le_bytes(), d.bias().unwrap().to_le_bytes())
    };
    let first = snapshot(&p);

    p.terminate();
    assert_eq!(p.state(), LifecycleState::Terminated);
    assert!(p.params().device().is_none());

    p.initialize(&stream).unwrap();
    assert_eq!(p.state(), LifecycleState::Initialized);
    assert_eq!(snapshot(&p), first);
}

#[test]
fn enqueue_after_terminate_reports_failure() {
    let stream = Stream::host();
    let mut p = fixed_plugin(0, &[1.0; 2], &[0.0; 2], None);
    let out = run_f32(&mut p, 2, &[1.0, 2.0], &[0.0, 0.0]);
    assert!(out[0] < 0.0);
    p.terminate();

    let descs = vec![TensorDesc::new(vec![1, 2], DataType::Float, TensorFormat::Linear); 3];
    let mut out = [0.0f32; 2];
    let status = p.enqueue(
        &descs[..2],
        &descs[2..],
        &[TensorRef::F32(&[1.0, 2.0]), TensorRef::F32(&[0.0, 0.0])],
        &mut [TensorMut::F32(&mut out)],
        &mut [],
        &stream,
    );
    assert!(!status.is_success());
    assert_eq!(out, [0.0, 0.0]);
}

#[test]
fn initialize_before_configure_uses_requested_precision() {
    let mut p = fixed_plugin(1, &[1.0; 2], &[0.0; 2], None);
    p.initialize(&Stream::host()).unwrap();
    assert_eq!(p.params().device().unwrap().param_type(), DataType::Half);
    assert_eq!(p.configured_precision(), None);
}

// ── serialization ───────────────────────────────────────────────────────────

#[test]
fn serialized_image_round_trips_through_creator() -> anyhow::Result<()> {
    let creator = SkipLayerNormPluginCreator::new();
    let original = fixed_plugin(2, &[1.0, 0.5, 0.25], &[0.0, 1.0, -1.0], Some(&[0.5, 0.5, 0.5]));

    let mut image = vec![0u8; original.serialization_size()];
    assert_eq!(original.serialize(&mut image)?, image.len());

    let restored = creator.deserialize_plugin("skip_ln", &image)?;
    let mut again = vec![0u8; restored.serialization_size()];
    restored.serialize(&mut again)?;
    assert_eq!(image, again);
    assert_eq!(restored.plugin_version(), "1");
    Ok(())
}

#[test]
fn deserialized_plugin_computes_identically() -> anyhow::Result<()> {
    let gamma = [1.5, 0.5, 1.0, 2.0];
    let beta = [0.0, 0.25, -0.25, 1.0];
    let mut original = fixed_plugin(0, &gamma, &beta, Some(&[0.1, 0.2, 0.3, 0.4]));

    let mut image = vec![0u8; original.serialization_size()];
    original.serialize(&mut image)?;
    let mut restored = SkipLayerNormPluginDynamic::deserialize("copy", &image)?
        .with_config(RuntimeConfig::default());
    assert_eq!(restored.origin(), Origin::FromBlob);
    assert_eq!(restored.ld(), 4);
    assert!(restored.has_bias());

    let input = [0.5, 1.5, -2.0, 3.0, 1.0, 1.0, 1.0, 2.0];
    let skip = [0.0, 1.0, 0.0, -1.0, 2.0, 0.0, 1.0, 0.0];
    assert_eq!(run_f32(&mut original, 4, &input, &skip), run_f32(&mut restored, 4, &input, &skip));
    Ok(())
}

#[test]
fn corrupt_image_is_rejected_by_creator() {
    let original = fixed_plugin(0, &[1.0; 2], &[0.0; 2], None);
    let mut image = vec![0u8; original.serialization_size()];
    original.serialize(&mut image).unwrap();

    let creator = SkipLayerNormPluginCreator::new();
    assert!(creator.deserialize_plugin("x", &image[..image.len() - 1]).is_err());
    image[16] = 7;
    assert!(creator.deserialize_plugin("x", &image).is_err());
}

// ── variable sequence lengths ───────────────────────────────────────────────

#[test]
fn var_seqlen_matches_fixed_layout_over_packed_tokens() {
    let gamma = [1.0, 2.0, 0.5, 1.0];
    let beta = [0.0, 0.5, 0.0, -0.5];
    let tokens = 5;
    let input: Vec<f32> = (0..tokens * 4).map(|i| (i as f32 * 0.37).sin()).collect();
    let skip: Vec<f32> = (0..tokens * 4).map(|i| (i as f32 * 0.11).cos()).collect();
    let expected = run_f32(&mut fixed_plugin(0, &gamma, &beta, None), 4, &input, &skip);

    let f = fields(0, &gamma, &beta, None);
    let mut p: SkipLayerNormVarSeqlenPlugin = SkipLayerNormVarSeqlenPluginCreator::new()
        .create("packed", &f)
        .unwrap()
        .with_config(RuntimeConfig::default());
    assert_eq!(p.plugin_version(), "2");

    let act = TensorDesc::new(vec![tokens as i64, 4], DataType::Float, TensorFormat::Linear);
    let offsets_desc = TensorDesc::new(vec![3], DataType::Int32, TensorFormat::Linear);
    let inputs = [act.clone(), act.clone(), offsets_desc];
    let outputs = [act];
    for pos in 0..4 {
        let io = [inputs[0].clone(), inputs[1].clone(), inputs[2].clone(), outputs[0].clone()];
        assert!(p.supports_format_combination(pos, &io, 3, 1).unwrap(), "slot {pos}");
    }

    let stream = Stream::host();
    p.configure(&inputs, &outputs).unwrap();
    p.initialize(&stream).unwrap();

    let mut out = vec![0.0f32; tokens * 4];
    let status = p.enqueue(
        &inputs,
        &outputs,
        &[TensorRef::F32(&input), TensorRef::F32(&skip), TensorRef::I32(&[0, 2, 5])],
        &mut [TensorMut::F32(&mut out)],
        &mut [],
        &stream,
    );
    assert!(status.is_success());
    assert_eq!(out, expected);

    let status = p.enqueue(
        &inputs,
        &outputs,
        &[TensorRef::F32(&input), TensorRef::F32(&skip), TensorRef::I32(&[0, 4, 3])],
        &mut [TensorMut::F32(&mut out)],
        &mut [],
        &stream,
    );
    assert!(!status.is_success());
}

#[test]
fn var_seqlen_int8_matches_fixed_layout() {
    let ld = 5;
    let tokens = 4;
    let stride = 8;
    let gamma = [1.0, 0.5, 2.0, 1.0, 0.75];
    let beta = [0.0, 0.25, -0.25, 0.5, 0.0];
    let input: Vec<i8> = (0..tokens * stride).map(|i| ((i * 29) % 120) as i8 - 60).collect();
    let skip: Vec<i8> = (0..tokens * stride).map(|i| ((i * 13) % 90) as i8 - 45).collect();

    let dims = vec![tokens as i64, ld as i64, 1, 1];
    let act = |scale: f32| {
        TensorDesc::new(dims.clone(), DataType::Int8, TensorFormat::Chw4).with_scale(scale)
    };
    let offsets_desc = TensorDesc::new(vec![3], DataType::Int32, TensorFormat::Linear);
    let stream = Stream::host();

    let mut fixed = fixed_plugin(2, &gamma, &beta, None);
    let (fixed_in, fixed_out) = ([act(0.04), act(0.02)], [act(0.05)]);
    fixed.configure(&fixed_in, &fixed_out).unwrap();
    fixed.initialize(&stream).unwrap();
    let mut expected = vec![9i8; tokens * stride];
    let status = fixed.enqueue(
        &fixed_in,
        &fixed_out,
        &[TensorRef::I8(&input), TensorRef::I8(&skip)],
        &mut [TensorMut::I8(&mut expected)],
        &mut [],
        &stream,
    );
    assert!(status.is_success());

    let mut packed: SkipLayerNormVarSeqlenPlugin = SkipLayerNormVarSeqlenPluginCreator::new()
        .create("packed_int8", &fields(2, &gamma, &beta, None))
        .unwrap()
        .with_config(RuntimeConfig::default());
    let inputs = [act(0.04), act(0.02), offsets_desc];
    let outputs = [act(0.05)];
    for pos in 0..4 {
        let io = [inputs[0].clone(), inputs[1].clone(), inputs[2].clone(), outputs[0].clone()];
        assert!(packed.supports_format_combination(pos, &io, 3, 1).unwrap(), "slot {pos}");
    }
    packed.configure(&inputs, &outputs).unwrap();
    packed.initialize(&stream).unwrap();

    let mut out = vec![9i8; tokens * stride];
    let status = packed.enqueue(
        &inputs,
        &outputs,
        &[TensorRef::I8(&input), TensorRef::I8(&skip), TensorRef::I32(&[0, 1, 4])],
        &mut [TensorMut::I8(&mut out)],
        &mut [],
        &stream,
    );
    assert!(status.is_success(), "status {}", status.code());
    assert_eq!(out, expected);
    for row in out.chunks(stride) {
        assert_eq!(&row[ld..], &[0, 0, 0]);
    }
}

// ── malformed launches ──────────────────────────────────────────────────────

fn initialized_f32(ld: usize) -> (SkipLayerNormPluginDynamic, Stream) {
    let mut p = fixed_plugin(0, &vec![1.0; ld], &vec![0.0; ld], None);
    let descs = vec![TensorDesc::new(vec![1, ld as i64], DataType::Float, TensorFormat::Linear); 3];
    let stream = Stream::host();
    p.configure(&descs[..2], &descs[2..]).unwrap();
    p.initialize(&stream).unwrap();
    (p, stream)
}

fn enqueue_f32(
    p: &SkipLayerNormPluginDynamic,
    stream: &Stream,
    descs: &[TensorDesc],
    out: &mut [f32],
) -> skipln_common::DispatchStatus {
    let data = [1.0f32, 2.0, 3.0, 4.0];
    p.enqueue(
        &descs[..2],
        &descs[2..],
        &[TensorRef::F32(&data), TensorRef::F32(&data)],
        &mut [TensorMut::F32(out)],
        &mut [],
        stream,
    )
}

#[test]
fn overflowing_extents_report_failure() {
    let (p, stream) = initialized_f32(4);
    for dims in [vec![1 << 62, 4], vec![1 << 40, 1 << 30, 4]] {
        let descs = vec![TensorDesc::new(dims.clone(), DataType::Float, TensorFormat::Linear); 3];
        let mut out = [0.0f32; 4];
        let status = enqueue_f32(&p, &stream, &descs, &mut out);
        assert!(!status.is_success(), "{dims:?} reported success");
        assert_eq!(out, [0.0; 4]);
    }
    assert_eq!(stream.launches(), 0);
}

#[test]
fn descriptors_larger_than_buffers_report_failure() {
    let (p, stream) = initialized_f32(4);
    let mut out = [0.0f32; 4];

    let descs = vec![TensorDesc::new(vec![3, 4], DataType::Float, TensorFormat::Linear); 3];
    assert!(!enqueue_f32(&p, &stream, &descs, &mut out).is_success());

    let mut descs = vec![TensorDesc::new(vec![1, 4], DataType::Float, TensorFormat::Linear); 3];
    descs[2].dims = vec![4, 1];
    assert!(!enqueue_f32(&p, &stream, &descs, &mut out).is_success());

    descs[2].dims = vec![-1, 4];
    assert!(!enqueue_f32(&p, &stream, &descs, &mut out).is_success());
    assert_eq!(out, [0.0; 4]);

    descs[2].dims = vec![1, 4];
    assert!(enqueue_f32(&p, &stream, &descs, &mut out).is_success());
    assert_eq!(stream.launches(), 1);
}

#[test]
fn int8_refuses_interleaved_shapes_it_cannot_address() {
    let mut p = fixed_plugin(2, &[1.0; 4], &[0.0; 4], None);
    for dims in [vec![3, 4], vec![4, 3, 4]] {
        let io = vec![
            TensorDesc::new(dims.clone(), DataType::Int8, TensorFormat::Chw4).with_scale(0.1);
            3
        ];
        assert!(!p.supports_format_combination(0, &io, 2, 1).unwrap(), "{dims:?}");
        assert!(p.configure(&io[..2], &io[2..]).is_err(), "{dims:?}");
    }
    assert_eq!(p.state(), LifecycleState::Constructed);
}

#[test]
fn repeated_launches_reuse_uploaded_parameters() {
    let (p, stream) = initialized_f32(4);
    let uploads = stream.uploads();
    assert!(p.params().params_on_device());
    let descs = vec![TensorDesc::new(vec![1, 4], DataType::Float, TensorFormat::Linear); 3];
    let mut out = [0.0f32; 4];
    for _ in 0..3 {
        assert!(enqueue_f32(&p, &stream, &descs, &mut out).is_success());
    }
    assert_eq!(stream.launches(), 3);
    assert_eq!(stream.uploads(), uploads);
}
