use neurotrials::{
    read_trials, Buffer, BufferData, EnhancementCategory, InfoMap, JsonLinesTrialSink,
    NumericEventList, OffsetThenGain, PipelineConfig, ReadResults, Reader, ReaderRoute,
    ReaderRouter, Result, Transformer, Trial, TrialDelimiter, TrialExtractor, TrialPipeline,
    TrialsError,
};
use std::collections::{HashMap, VecDeque};
use std::fs;

// 初始化测试日志
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn events(rows: &[Vec<f64>]) -> NumericEventList {
    NumericEventList::from_rows(rows).unwrap()
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{:?} vs {:?}", actual, expected);
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "{:?} vs {:?}", actual, expected);
    }
}

/// Replays one scripted result per call, then reports end of data.
struct ScriptedReader {
    name: String,
    value_count: usize,
    reads: VecDeque<Result<ReadResults>>,
}

impl ScriptedReader {
    fn rows(name: &str, rows: &[Vec<f64>]) -> Self {
        let reads = rows
            .iter()
            .map(|row| {
                let data: BufferData = events(&[row.clone()]).into();
                Ok(ReadResults::from([(name.to_string(), data)]))
            })
            .collect();
        ScriptedReader {
            name: name.to_string(),
            value_count: rows.first().map_or(1, |r| r.len() - 1),
            reads,
        }
    }

    fn failing_on_call(mut self, call: usize) -> Self {
        self.reads.insert(
            call - 1,
            Err(TrialsError::InvalidFormat("corrupt source".to_string())),
        );
        self
    }
}

impl Reader for ScriptedReader {
    fn read_next(&mut self) -> Result<ReadResults> {
        self.reads.pop_front().unwrap_or(Err(TrialsError::EndOfData))
    }

    fn initial(&self) -> Result<ReadResults> {
        Ok(ReadResults::from([(
            self.name.clone(),
            NumericEventList::empty(self.value_count).into(),
        )]))
    }
}

fn router_for(reader: ScriptedReader, empty_reads_allowed: usize) -> ReaderRouter {
    let name = reader.name.clone();
    let routes = vec![ReaderRoute::new(&name, &name)];
    ReaderRouter::new(&name, Box::new(reader), routes, empty_reads_allowed).unwrap()
}

#[test]
fn test_copy_time_range_is_idempotent() {
    let list = events(&[vec![0.0, 1.0], vec![0.5, 2.0], vec![1.0, 3.0], vec![1.5, 4.0]]);
    let once = list.copy_time_range(Some(0.5), Some(1.5));
    let twice = once.copy_time_range(Some(0.5), Some(1.5));
    assert_eq!(once, twice);
    assert_eq!(once.get_times(), vec![0.5, 1.0]);
}

#[test]
fn test_append_then_discard_keeps_new_rows() {
    let mut a = events(&[vec![0.0, 1.0], vec![2.0, 9.0]]);
    let b = events(&[vec![1.0, 5.0], vec![3.0, 6.0]]);
    a.append(&b).unwrap();
    a.discard_before(1.0);

    // B 的所有行，加上 A 中时间不早于 B 起点的行
    assert_eq!(a.get_times(), vec![2.0, 1.0, 3.0]);
    assert_eq!(a.get_values(0), vec![9.0, 5.0, 6.0]);
}

#[test]
fn test_offset_then_gain_exact() {
    let data: BufferData = events(&[vec![0.0, 1.0, 10.0], vec![1.0, -3.0, 20.0]]).into();
    let out = OffsetThenGain::new(0.25, -4.0, 0).transform(&data).unwrap();
    let out = out.as_events().unwrap();
    assert_eq!(out.get_values(0), vec![(1.0 + 0.25) * -4.0, (-3.0 + 0.25) * -4.0]);
    assert_eq!(out.get_values(1), vec![10.0, 20.0]);
}

#[test]
fn test_router_circuit_breaker() {
    init_logging();
    let reader = ScriptedReader::rows("codes", &[vec![0.0, 1.0], vec![1.0, 1.0], vec![2.0, 1.0]])
        .failing_on_call(3);
    let mut router = router_for(reader, 3);

    let outcomes: Vec<bool> = (0..5).map(|_| router.route_next()).collect();
    assert_eq!(outcomes, vec![true, true, false, false, false]);
    assert!(!router.still_going());
    assert_eq!(router.buffer("codes").unwrap().len(), 2);
}

#[test]
fn test_route_until_stops_at_target() {
    let reader = ScriptedReader::rows(
        "codes",
        &[vec![0.0, 0.0], vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 30.0]],
    );
    let mut router = router_for(reader, 0);

    assert_eq!(router.route_until(1.5), 2.0);
    let buffered = router.buffer("codes").unwrap().data().as_events().unwrap();
    assert_eq!(buffered.get_times(), vec![0.0, 1.0, 2.0]);

    // 已经追上，不再读取
    assert_eq!(router.route_until(1.5), 2.0);
    assert_eq!(router.buffer("codes").unwrap().len(), 3);
}

#[test]
fn test_route_until_reports_undershoot() {
    let reader = ScriptedReader::rows("codes", &[vec![0.5, 1.0]]);
    let mut router = router_for(reader, 2);

    let reached = router.route_until(10.0);
    assert!(reached < 10.0);
    assert_eq!(reached, 0.5);
    assert!(!router.still_going());
}

#[test]
fn test_delimiter_sequence() {
    let starts = Buffer::new(events(&[vec![1.0, 1.0], vec![2.0, 1.0], vec![3.0, 1.0]]).into());
    let mut delimiter = TrialDelimiter::new("start", 1.0, 0, 0.0);

    let bounds: Vec<(f64, Option<f64>)> = delimiter
        .next(&starts)
        .into_iter()
        .map(|(_, t)| (t.start_time, t.end_time))
        .collect();
    assert_eq!(bounds, vec![(0.0, Some(1.0)), (1.0, Some(2.0)), (2.0, Some(3.0))]);

    let (_, last) = delimiter.last();
    assert_eq!((last.start_time, last.end_time), (3.0, None));
    assert_eq!(delimiter.trial_count(), 4);
}

#[test]
fn test_extraction_aligns_to_earliest_wrt_event() {
    let start = Buffer::new(events(&[vec![1.0, 1.0], vec![2.0, 1.0], vec![3.0, 1.0]]).into());
    let wrt = Buffer::new(
        events(&[vec![1.5, 42.0], vec![2.5, 42.0], vec![2.6, 42.0], vec![3.5, 42.0]]).into(),
    );
    let foo = Buffer::new(events(&[vec![1.2, 0.0], vec![1.3, 0.0]]).into());
    let buffers: HashMap<&str, &Buffer> =
        HashMap::from([("start", &start), ("wrt", &wrt), ("foo", &foo)]);

    let mut delimiter = TrialDelimiter::new("start", 1.0, 0, 0.0);
    let extractor = TrialExtractor::new("wrt", 42.0, 0, vec!["foo".to_string()]);

    let trials = delimiter.next(&start);
    let (number, mut trial) = trials[1].clone();
    assert_eq!((trial.start_time, trial.end_time), (1.0, Some(2.0)));

    extractor
        .populate_trial(&mut trial, number, &buffers, &InfoMap::new(), &InfoMap::new())
        .unwrap();
    assert_eq!(trial.wrt_time, 1.5);
    let foo = trial.get_buffer_data("foo").unwrap().as_events().unwrap();
    assert_close(&foo.get_times(), &[-0.3, -0.2]);

    // [2, 3) 中最早的是 2.5
    let (number, mut trial) = trials[2].clone();
    extractor
        .populate_trial(&mut trial, number, &buffers, &InfoMap::new(), &InfoMap::new())
        .unwrap();
    assert_eq!(trial.wrt_time, 2.5);
    assert!(trial.get_buffer_data("foo").unwrap().is_empty());
}

#[test]
fn test_pipeline_end_to_end_with_three_readers() {
    init_logging();
    let start = ScriptedReader::rows("start", &[vec![1.0, 1.0], vec![2.0, 1.0], vec![3.0, 1.0]]);
    let wrt = ScriptedReader::rows(
        "wrt",
        &[vec![1.5, 42.0], vec![2.5, 42.0], vec![2.6, 42.0], vec![3.5, 42.0]],
    );
    let foo = ScriptedReader::rows("foo", &[vec![1.2, 0.0], vec![1.3, 0.0], vec![3.2, 0.0]]);

    let routers = vec![router_for(start, 3), router_for(wrt, 3), router_for(foo, 3)];
    let delimiter = TrialDelimiter::new("start", 1.0, 0, 0.0);
    let extractor =
        TrialExtractor::new("wrt", 42.0, 0, vec!["wrt".to_string(), "foo".to_string()]);
    let mut pipeline = TrialPipeline::new(routers, delimiter, extractor).unwrap();

    let mut trials: Vec<Trial> = Vec::new();
    let summary = pipeline.run(&mut trials, &mut []).unwrap();

    assert!(summary.reached_end);
    assert_eq!(summary.trial_count, 4);
    let wrt_times: Vec<f64> = trials.iter().map(|t| t.wrt_time).collect();
    assert_eq!(wrt_times, vec![0.0, 1.5, 2.5, 3.5]);

    let foo = trials[1].get_buffer_data("foo").unwrap().as_events().unwrap();
    assert_close(&foo.get_times(), &[-0.3, -0.2]);

    let last = trials.last().unwrap();
    assert_eq!(last.end_time, None);
    let foo = last.get_buffer_data("foo").unwrap().as_events().unwrap();
    assert_close(&foo.get_times(), &[-0.3]);
}

#[test]
fn test_broken_reader_degrades_run() {
    init_logging();
    let start = ScriptedReader::rows("start", &[vec![1.0, 1.0], vec![2.0, 1.0]]);
    let broken = ScriptedReader::rows("foo", &[vec![0.5, 1.0], vec![1.5, 1.0]]).failing_on_call(1);

    let routers = vec![router_for(start, 3), router_for(broken, 3)];
    let delimiter = TrialDelimiter::new("start", 1.0, 0, 0.0);
    let extractor = TrialExtractor::new("start", 1.0, 0, vec!["foo".to_string()]);
    let mut pipeline = TrialPipeline::new(routers, delimiter, extractor).unwrap();

    let mut trials: Vec<Trial> = Vec::new();
    let summary = pipeline.run(&mut trials, &mut []).unwrap();

    assert_eq!(summary.trial_count, 3);
    assert!(trials.iter().all(|t| t.get_buffer_data("foo").unwrap().is_empty()));
}

#[test]
fn test_config_pipeline_writes_json_lines() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let codes = dir.path().join("codes.csv");
    let rules = dir.path().join("rules.csv");
    let output = dir.path().join("trials.jsonl");

    // 1 = 试次开始，5000 + x 成对编码
    fs::write(
        &codes,
        "time,code\n1.0,1\n1.1,5000\n1.2,5045\n2.0,1\n2.1,5000\n2.2,5090\n3.0,1\n",
    )
    .unwrap();
    fs::write(&rules, "code,name,category\n5000,angle,value\n").unwrap();

    let json = format!(
        r#"{{
            "experiment": {{"lab": "test"}},
            "subject": {{"id": "S01"}},
            "readers": [{{
                "name": "codes",
                "reader": {{"type": "csv_events", "path": {:?}, "result_name": "ecodes"}},
                "routes": [
                    {{"result_name": "ecodes", "buffer_name": "delimiter",
                      "transformers": [{{"type": "filter_range", "max": 2}}]}},
                    {{"result_name": "ecodes"}}
                ]
            }}],
            "trials": {{
                "start_buffer": "delimiter",
                "start_value": 1,
                "enhancers": [
                    {{"type": "duration"}},
                    {{"type": "paired_codes", "buffer_name": "ecodes", "rules_csv": {:?},
                      "min": 5000, "max": 6000, "offset": -5000}},
                    {{"type": "event_times", "buffer_name": "ecodes",
                      "rules": [{{"value": 5000, "name": "code_times"}}]}}
                ]
            }}
        }}"#,
        codes, rules
    );

    let config = PipelineConfig::from_json_str(&json).unwrap();
    let mut pipeline = config.build().unwrap();
    let mut sink = JsonLinesTrialSink::open(&output).unwrap();
    let summary = pipeline.run(&mut sink, &mut []).unwrap();
    assert_eq!(summary.trial_count, 4);
    assert_eq!(sink.trials_written(), 4);

    let trials = read_trials(&output).unwrap();
    assert_eq!(trials.len(), 4);

    let second = &trials[1];
    assert_eq!(second.wrt_time, 1.0);
    assert_eq!(second.get_enhancement("angle").and_then(|v| v.as_number()), Some(45.0));
    assert_eq!(second.get_enhancement("duration").and_then(|v| v.as_number()), Some(1.0));
    assert_eq!(
        second.enhancements["code_times"].category,
        EnhancementCategory::Time
    );
    let code_times = second.get_enhancement("code_times").and_then(|v| v.as_numbers()).unwrap();
    assert_close(code_times, &[0.1]);

    assert_eq!(trials[2].get_enhancement("angle").and_then(|v| v.as_number()), Some(90.0));
    // 第一个试次 [0, 1) 内没有编码
    assert!(trials[0].get_enhancement("angle").is_none());
}

#[test]
fn test_config_rejects_unknown_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let codes = dir.path().join("codes.csv");
    fs::write(&codes, "1.0,1\n").unwrap();

    let json = format!(
        r#"{{
            "readers": [{{"name": "codes",
                          "reader": {{"type": "csv_events", "path": {:?}, "result_name": "ecodes"}}}}],
            "trials": {{"start_buffer": "missing", "start_value": 1}}
        }}"#,
        codes
    );
    let result = PipelineConfig::from_json_str(&json).unwrap().build();
    assert!(matches!(result, Err(TrialsError::Config(_))));
}

#[test]
fn test_config_from_missing_file() {
    let result = PipelineConfig::from_json_file("no/such/pipeline.json");
    assert!(matches!(result, Err(TrialsError::FileNotFound(_))));
}
