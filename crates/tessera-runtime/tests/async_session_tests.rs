//! Tests for the tokio wrapper.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tessera_core::{Artifact, CoreError, DataType, Dim, Graph, GraphBuilder, Shape, Tensor};
use tessera_providers::{CpuProviderOptions, StreamProviderOptions};
use tessera_runtime::{AsyncSession, SessionOptions, SessionState};

fn scale_graph() -> Result<Graph> {
    let n = Shape(vec![Dim::Symbolic("N".into())]);
    let mut b = GraphBuilder::new();
    b.add_input("x", DataType::F32, n.clone())?;
    b.add_input("k", DataType::F32, Shape::fixed([1]))?;
    b.add_value("y", DataType::F32, n)?;
    b.add_node("mul", "Mul", &["x", "k"], &["y"])?;
    b.add_output("y")?;
    Ok(b.build()?)
}

fn feeds(x: Vec<f32>, k: f32) -> Result<HashMap<String, Tensor>> {
    let len = x.len();
    Ok(HashMap::from([
        ("x".to_string(), Tensor::from_f32(x, vec![len])?),
        ("k".to_string(), Tensor::from_f32(vec![k], vec![1])?),
    ]))
}

fn options() -> SessionOptions {
    SessionOptions::new()
        .with_provider(CpuProviderOptions::default().with_thread_count(2), 0)
        .with_provider(StreamProviderOptions::default().with_stream_count(2), 1)
}

#[tokio::test]
async fn test_async_run() -> Result<()> {
    let session = AsyncSession::load(options(), Artifact::new(scale_graph()?)).await?;
    assert_eq!(session.state(), SessionState::Ready);

    let out = session.run(feeds(vec![1.0, 2.0, 3.0], 2.0)?).await?;
    assert_eq!(out["y"].to_vec_f32()?, vec![2.0, 4.0, 6.0]);

    session.close().await?;
    let err = session.run(feeds(vec![1.0], 1.0)?).await.unwrap_err();
    assert_eq!(err, CoreError::SessionClosed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_async_runs() -> Result<()> {
    let session = AsyncSession::load(options(), Artifact::new(scale_graph()?)).await?;

    let mut tasks = Vec::new();
    for i in 0..16usize {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            let x: Vec<f32> = (0..=i).map(|v| v as f32).collect();
            let out = session.run(feeds(x.clone(), 3.0)?).await?;
            let expected: Vec<f32> = x.iter().map(|v| v * 3.0).collect();
            assert_eq!(out["y"].to_vec_f32()?, expected);
            Ok::<_, anyhow::Error>(())
        }));
    }
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(30), task).await???;
    }

    assert_eq!(session.statistics().total_runs, 16);
    Ok(())
}

#[tokio::test]
async fn test_run_batch_preserves_order() -> Result<()> {
    let session = AsyncSession::load(options(), Artifact::new(scale_graph()?)).await?;

    let batch = vec![
        feeds(vec![1.0, 1.0], 1.0)?,
        feeds(vec![1.0], 5.0)?,
        HashMap::new(),
        feeds(vec![2.0, 2.0, 2.0], -1.0)?,
    ];
    let results = session.run_batch(batch).await;
    assert_eq!(results.len(), 4);
    assert_eq!(results[0].as_ref().map(|o| o["y"].shape().to_vec()), Ok(vec![2]));
    assert_eq!(results[1].as_ref().map(|o| o["y"].shape().to_vec()), Ok(vec![1]));
    assert!(matches!(results[2], Err(CoreError::InvalidArgument(_))));
    let last = results[3].as_ref().map_err(Clone::clone)?;
    assert_eq!(last["y"].to_vec_f32()?, vec![-2.0, -2.0, -2.0]);
    Ok(())
}

#[tokio::test]
async fn test_async_load_failure() -> Result<()> {
    let err = AsyncSession::load(SessionOptions::default(), Artifact::new(scale_graph()?))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument(_)));
    Ok(())
}
