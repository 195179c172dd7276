mod common;

use std::fs;
use std::io::Read;
use std::net::TcpListener;
use std::time::Duration;

use common::{Script, assert_succeeded, harness, harness_with, long, text};
use hiveq_db::{QueryStatus, Value};
use hiveq_worker::{DataUnit, ErrorKind, ExecError, JOB_NAME_PREFIX};

#[test]
fn single_row_select_writes_header_and_row() {
    let h = harness(Script::default());
    let result = h
        .service
        .submit_sync("lite", "select 1 as n, 'a' as s", "alice", true, 100)
        .expect("query");

    assert_eq!(result.columns, vec!["n", "s"]);
    assert_eq!(result.records, vec![vec![Some("1".to_string()), Some("a".to_string())]]);
    assert_eq!(result.line_number, 2);
    assert_eq!(result.warning_message, None);
    assert_eq!(result.raw_data_size.value, 20.0);
    assert_eq!(result.raw_data_size.unit, DataUnit::B);
    assert_eq!(h.result_text("lite", &result.query_id), "[\"n\",\"s\"]\n[\"1\",\"a\"]\n");
    assert_succeeded(&h.record("lite", &result.query_id).expect("history row"));
}

#[test]
fn row_limit_keeps_first_rows_and_warns_once() {
    let h = harness(Script::default());
    let sql = "with recursive c(n) as (select 1 union all select n + 1 from c where n < 5) \
               select n from c";
    let result = h.service.submit_sync("lite", sql, "alice", false, 3).expect("query");

    assert_eq!(
        result.records,
        vec![vec![Some("1".to_string())], vec![Some("2".to_string())], vec![Some("3".to_string())]]
    );
    assert_eq!(
        result.warning_message.as_deref(),
        Some("now fetch size is 3. This is more than 3. So, fetch operation stopped.")
    );
    assert_eq!(result.line_number, 6);
    let text = h.result_text("lite", &result.query_id);
    assert_eq!(text.lines().count(), 6);
    assert!(text.ends_with("[\"5\"]\n"));
}

#[test]
fn show_queries_keep_every_row() {
    let rows = (0..50).map(|i| vec![text(&format!("table_{i}"))]).collect();
    let h = harness(Script::rows(&["tab_name"], rows));
    let result = h.service.submit_sync("dw", "SHOW TABLES", "alice", true, 3).expect("query");

    assert_eq!(result.records.len(), 50);
    assert_eq!(result.warning_message, None);
    assert_eq!(result.line_number, 51);
}

#[test]
fn size_cap_fails_and_records_error() {
    let h = harness_with(Script::default(), |config| config.with("max.result.file.byte.size", 15));
    let err = h
        .service
        .submit_sync("lite", "select 1 as n, 'ab' as s", "alice", true, 100)
        .expect_err("over budget");

    let expected = format!("Result file size exceeded 15 bytes. queryId={}", err.query_id);
    assert_eq!(err.kind(), ErrorKind::SizeExceeded);
    assert_eq!(err.cause.to_string(), expected);

    let record = h.record("lite", &err.query_id).expect("error row");
    assert_eq!(record.status, QueryStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some(expected.as_str()));
    assert_eq!(fs::read_to_string(h.error_path("lite", &err.query_id)).unwrap(), expected);
    // The partial file is left in place.
    assert_eq!(h.result_text("lite", &err.query_id), "[\"n\",\"s\"]\n[\"1\",\"ab\"]\n");
}

#[test]
fn slow_rows_time_out_without_history() {
    let script = Script {
        row_delay: Duration::from_millis(700),
        ..Script::rows(&["x"], vec![vec![long(1)], vec![long(2)], vec![long(3)]])
    };
    let h = harness_with(script, |config| {
        config.with("hive.query.max-run-time-seconds.dw", 1)
    });
    let err = h
        .service
        .submit_sync("dw", "select sleep(100)", "alice", true, 100)
        .expect_err("timeout");

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(matches!(err.cause, ExecError::Timeout { limit, .. } if limit == Duration::from_secs(1)));
    let record = h.record("dw", &err.query_id).expect("error row");
    assert_eq!(record.status, QueryStatus::Failed);
    assert_eq!(
        record.error_message,
        Some(format!(
            "Query failed (#{}) in dw: Query exceeded maximum time limit of 1s",
            err.query_id
        ))
    );
    assert_eq!(h.hive.timeouts(), vec![Duration::from_secs(1)]);
}

#[test]
fn sync_without_history_leaves_no_row() {
    let h = harness(Script::default());
    let result = h
        .service
        .submit_sync("lite", "select 'x' as v", "alice", false, 10)
        .expect("query");

    assert!(h.record("lite", &result.query_id).is_none());
    assert_eq!(h.result_text("lite", &result.query_id), "[\"v\"]\n[\"x\"]\n");
}

#[test]
fn zero_row_limit_retains_nothing() {
    let h = harness(Script::rows(&["n"], vec![vec![long(7)], vec![long(8)]]));
    let result = h.service.submit_sync("dw", "select n from t", "alice", false, 0).expect("query");

    assert!(result.records.is_empty());
    assert_eq!(
        result.warning_message.as_deref(),
        Some("now fetch size is 0. This is more than 0. So, fetch operation stopped.")
    );
    assert_eq!(result.line_number, 3);
}

#[test]
fn integers_stay_decimal_and_nulls_stay_null() {
    let h = harness(Script::default());
    let result = h
        .service
        .submit_sync(
            "lite",
            "select -42 as n, null as z, -9007199254740993 as big",
            "alice",
            false,
            10,
        )
        .expect("query");

    assert_eq!(
        result.records,
        vec![vec![Some("-42".to_string()), None, Some("-9007199254740993".to_string())]]
    );
    assert_eq!(
        h.result_text("lite", &result.query_id),
        "[\"n\",\"z\",\"big\"]\n[\"-42\",null,\"-9007199254740993\"]\n"
    );
}

#[test]
fn result_file_decodes_back_to_every_row() {
    let rows = (0..20)
        .map(|i| vec![long(i), if i % 3 == 0 { Value::Null } else { text(&format!("é{i}")) }])
        .collect();
    let h = harness(Script::rows(&["id", "label"], rows));
    let result = h.service.submit_sync("dw", "select * from labels", "alice", false, 5).expect("query");

    let path = h.result_path("dw", &result.query_id);
    let bytes = fs::read(&path).expect("file");
    let text = String::from_utf8(bytes.clone()).expect("utf-8");
    let mut lines = text.lines();
    let header: Vec<String> = serde_json::from_str(lines.next().expect("header")).unwrap();
    assert_eq!(header, result.columns);
    let decoded: Vec<Vec<Option<String>>> = lines.map(|line| serde_json::from_str(line).unwrap()).collect();
    assert_eq!(decoded.len(), 20);
    assert_eq!(&decoded[..5], &result.records[..]);
    assert_eq!(decoded[3], vec![Some("3".to_string()), None]);

    let mut reencoded = serde_json::to_vec(&header).unwrap();
    reencoded.push(b'\n');
    for row in &decoded {
        reencoded.extend(serde_json::to_vec(row).unwrap());
        reencoded.push(b'\n');
    }
    assert_eq!(reencoded, bytes);
    assert_eq!(result.raw_data_size.value, bytes.len() as f64);
}

#[test]
fn job_is_tagged_with_query_id() {
    let h = harness(Script::rows(&["n"], vec![vec![long(1)]]));
    let result = h.service.submit_sync("dw", "select 1", "alice", false, 10).expect("query");

    assert_eq!(
        h.hive.statements(),
        vec![
            format!("set mapreduce.job.name={JOB_NAME_PREFIX}{}", result.query_id),
            "select 1".to_string(),
        ]
    );
    assert_eq!(h.hive.timeouts(), vec![Duration::from_secs(3600)]);
}

#[test]
fn rejected_job_tag_fails_unless_best_effort() {
    let h = harness(Script::default());
    let err = h
        .service
        .submit_sync("strict", "select 1", "alice", true, 10)
        .expect_err("set rejected");
    assert_eq!(err.kind(), ErrorKind::Sql);
    let record = h.record("strict", &err.query_id).expect("error row");
    assert_eq!(record.status, QueryStatus::Failed);

    let result = h.service.submit_sync("lite", "select 1", "alice", true, 10).expect("query");
    assert_succeeded(&h.record("lite", &result.query_id).expect("history row"));
}

#[test]
fn engine_failure_is_recorded() {
    let script = Script {
        fail_query: Some("Table not found 'missing'".to_string()),
        ..Script::default()
    };
    let h = harness(script);
    let err = h
        .service
        .submit_sync("dw", "select * from missing", "alice", true, 10)
        .expect_err("sql failure");

    assert_eq!(err.kind(), ErrorKind::Sql);
    let record = h.record("dw", &err.query_id).expect("error row");
    assert_eq!(record.error_message.as_deref(), Some("Table not found 'missing'"));
    assert_eq!(
        fs::read_to_string(h.error_path("dw", &err.query_id)).unwrap(),
        "Table not found 'missing'"
    );
}

#[test]
fn missing_datasource_is_config_error_without_row() {
    let h = harness(Script::default());
    let err = h
        .service
        .submit_sync("nowhere", "select 1", "alice", true, 10)
        .expect_err("no coordinates");

    assert_eq!(err.kind(), ErrorKind::ConfigMissing);
    assert!(err.cause.to_string().contains("hive.jdbc.nowhere.url"));
    assert!(h.record("nowhere", &err.query_id).is_none());
}

#[test]
fn unregistered_engine_is_driver_load_error() {
    let h = harness_with(Script::default(), |config| {
        config.with("hive.jdbc.mysql.url", "jdbc:mysql://db:3306/x")
            .with("hive.jdbc.mysql.user", "u")
            .with("hive.jdbc.mysql.password", "p")
    });
    let err = h
        .service
        .submit_sync("mysql", "select 1", "alice", true, 10)
        .expect_err("no driver");
    assert_eq!(err.kind(), ErrorKind::DriverLoad);
    assert!(h.record("mysql", &err.query_id).is_none());
}

#[test]
fn telemetry_event_is_emitted_on_success() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let reader = std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().expect("accept");
        let mut buf = Vec::new();
        socket.read_to_end(&mut buf).expect("read");
        buf
    });

    let h = harness_with(Script::rows(&["n"], vec![vec![long(1)]]), |config| {
        config
            .with("fluentd.executed.tag", "yanagishima.executed")
            .with("fluentd.host", "127.0.0.1")
            .with("fluentd.port", port)
    });
    let result = h.service.submit_sync("dw", "select 1", "bob", false, 10).expect("query");

    let (tag, _time, event): (String, u64, serde_json::Value) =
        rmp_serde::from_slice(&reader.join().expect("reader")).expect("decode");
    assert_eq!(tag, "yanagishima.executed");
    assert_eq!(event["user"], "bob");
    assert_eq!(event["query"], "select 1");
    assert_eq!(event["query_id"], result.query_id.as_str());
    assert_eq!(event["datasource"], "dw");
    assert_eq!(event["engine"], "hive");
    assert!(event["elapsed_time_millseconds"].is_u64());
}

#[test]
fn unreachable_telemetry_does_not_fail_query() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    let h = harness_with(Script::rows(&["n"], vec![vec![long(1)]]), |config| {
        config
            .with("fluentd.executed.tag", "yanagishima.executed")
            .with("fluentd.host", "127.0.0.1")
            .with("fluentd.port", port)
    });
    h.service.submit_sync("dw", "select 1", "bob", true, 10).expect("query");
}
