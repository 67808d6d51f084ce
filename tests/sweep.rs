use std::{path::PathBuf, time::Duration};

use neuron_sweep::{
    config::{ReportConfig, SweepConfig, TrainConfig},
    dataset::{prepare_table, synthetic},
    report,
    sweep::{run_iteration, run_sweep, widths, SweepInputs},
    Phase,
};

fn small_config(output_dir: PathBuf, iterations: usize) -> SweepConfig {
    SweepConfig {
        iterations,
        memory_interval_ms: 5,
        train: TrainConfig {
            epochs: 2,
            verbose: false,
            ..Default::default()
        },
        report: ReportConfig {
            output_dir,
            width: 640,
            height: 640,
            show: false,
        },
        ..Default::default()
    }
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("neuron_sweep_{}_{name}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn single_iteration_on_synthetic_data() {
    let config = small_config(scratch_dir("single"), 1);
    let table = synthetic(100, 3, "security", 11).unwrap();
    let data = prepare_table(&table, &config.data).unwrap();
    assert_eq!(data.test_labels.len(), 30);

    let inputs = SweepInputs::new(&data);
    let iteration = run_iteration(3, &inputs, &config).unwrap();

    assert_eq!(iteration.predictions.len(), data.test_labels.len());
    assert_eq!(iteration.record.width, 3);
    assert_eq!(iteration.fit.history.len(), 2);

    let test = iteration.record.test;
    assert!(test.mae.is_finite());
    assert!(test.mae >= 0.0);
    assert!(test.elapsed_secs >= 0.0);
    assert!(test.peak_memory_mb > 0.0);
    assert!(iteration.record.train.mae >= 0.0);
    assert!(iteration.record.train.peak_memory_mb > 0.0);
}

#[test]
fn sweep_sequences_have_one_entry_per_width() {
    let config = small_config(scratch_dir("lengths"), 3);
    let table = synthetic(60, 2, "security", 5).unwrap();
    let data = prepare_table(&table, &config.data).unwrap();

    let series = run_sweep(&data, &config).unwrap();
    assert_eq!(series.widths(), widths(&config).as_slice());
    assert_eq!(series.widths(), &[3, 6, 12]);
    for phase in [Phase::Train, Phase::Test] {
        assert_eq!(series.time(phase).len(), 3);
        assert_eq!(series.memory(phase).len(), 3);
        assert_eq!(series.mae(phase).len(), 3);
        assert!(series.mae(phase).iter().all(|&mae| mae >= 0.0));
    }
}

#[test]
fn constant_feature_aborts_preparation() {
    let mut table = synthetic(40, 2, "security", 2).unwrap();
    let rows: Vec<Vec<f64>> = table
        .rows()
        .iter()
        .map(|row| vec![row[0], 1.0, row[2]])
        .collect();
    table = neuron_sweep::Table::new(table.columns().to_vec(), rows).unwrap();

    let err = prepare_table(&table, &SweepConfig::default().data).unwrap_err();
    assert!(err.to_string().contains("`x1`"));
}

#[test]
fn figures_are_written_and_overwritten() {
    let dir = scratch_dir("figures");
    let config = small_config(dir.clone(), 2);
    let table = synthetic(50, 3, "security", 9).unwrap();
    let data = prepare_table(&table, &config.data).unwrap();
    let series = run_sweep(&data, &config).unwrap();

    let [train, test] = report::render_all(&series, &config.report).unwrap();
    assert_eq!(train, dir.join("train.png"));
    assert_eq!(test, dir.join("test.png"));

    let first: Vec<_> = [&train, &test]
        .iter()
        .map(|path| {
            let meta = std::fs::metadata(path).unwrap();
            assert!(meta.len() > 0);
            meta.modified().unwrap()
        })
        .collect();

    std::thread::sleep(Duration::from_millis(1100));
    report::render_all(&series, &config.report).unwrap();

    for (path, before) in [&train, &test].iter().zip(first) {
        let meta = std::fs::metadata(path).unwrap();
        assert!(meta.len() > 0);
        assert!(meta.modified().unwrap() > before);
    }

    std::fs::remove_dir_all(dir).unwrap();
}
