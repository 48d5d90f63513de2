use std::fs;
use std::time::Duration;

use mr::{read_records, wait_for_operation, Cluster, Job, KeyValue};
use mr_app::processors::registry;
use tarpc::context;
use tempfile::TempDir;

async fn run_job(cluster: &Cluster, inputs: &[&str], processor: &str, distributed: bool) -> Vec<KeyValue> {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    for (i, contents) in inputs.iter().enumerate() {
        fs::write(input.path().join(format!("{i}.txt")), contents).unwrap();
    }

    let client = cluster.connect().await.unwrap();
    let job = Job::new(input.path(), output.path(), processor, 1).with_work_dir(work.path());
    let op = client
        .submit_job(context::current(), job, distributed)
        .await
        .unwrap()
        .unwrap();
    let op = tokio::time::timeout(
        Duration::from_secs(20),
        wait_for_operation(&client, &op.id, Duration::from_millis(20)),
    )
    .await
    .expect("job never finished")
    .unwrap();
    assert_eq!(op.error, None);

    let job = cluster.master().job(&op.id).await.unwrap();
    read_records(job.output_file(0)).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_word_count() {
    let cluster = Cluster::start(2, registry()).await.unwrap();
    for distributed in [false, true] {
        let out = run_job(&cluster, &["the cat", "the dog"], "wc", distributed).await;
        assert_eq!(
            out,
            vec![
                KeyValue::new("cat", "1"),
                KeyValue::new("dog", "1"),
                KeyValue::new("the", "2"),
            ]
        );
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_average() {
    let cluster = Cluster::start(2, registry()).await.unwrap();
    let out = run_job(&cluster, &["1 2 3", "4 5"], "avg", true).await;
    assert_eq!(
        out,
        vec![KeyValue::new("cnt", "5"), KeyValue::new("sum", "15")]
    );
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_select() {
    let cluster = Cluster::start(2, registry()).await.unwrap();
    let out = run_job(
        &cluster,
        &[
            "students\nid,name\n1,Jill\n2,Jack\n",
            "students\nid,name\n7,Jill\n8,Ann\n",
        ],
        "select",
        true,
    )
    .await;

    let keys: Vec<&str> = out.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["1", "7"]);
    let row: serde_json::Value = serde_json::from_str(&out[1].value).unwrap();
    assert_eq!(row["id"], "7");
    assert_eq!(row["name"], "Jill");
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join() {
    let cluster = Cluster::start(2, registry()).await.unwrap();
    let out = run_job(
        &cluster,
        &[
            "students\nid,name\n1,Jill\n2,Jack\n",
            "enrollments\nstudent_id,course\n1,math\n3,art\n",
        ],
        "join",
        true,
    )
    .await;

    let keys: Vec<&str> = out.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["1", "2", "3"]);
    let rows: Vec<serde_json::Value> = serde_json::from_str(&out[0].value).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["students.name"], "Jill");
    assert_eq!(rows[0]["enrollments.course"], "math");
    assert_eq!(out[1].value, "[]");
    assert_eq!(out[2].value, "[]");
    cluster.shutdown().await.unwrap();
}
