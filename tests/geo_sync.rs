mod common;

use std::{sync::Arc, thread, time::Duration};

use ndarray::{Array2, array};

use common::{TIMEOUT, config, eventually, init_logs, var};
use communicator::{
    CommunicatorConfig, GeoCommunicator, InMemoryTransport, Result, Strategy, Variable, VariableStore,
    communicator::PARAM_INIT,
};

type Geo = GeoCommunicator<InMemoryTransport>;

fn geo(config: CommunicatorConfig) -> Result<(Geo, Arc<InMemoryTransport>, Arc<VariableStore>)> {
    let transport = Arc::new(InMemoryTransport::new());
    let training = Arc::new(VariableStore::new());
    let vars = [var("w", vec![], false), var("emb", vec![2, 2], true)];

    training.set("w", Variable::dense_vec(vec![0.0, 0.0]));
    training.set("emb", Variable::Dense(Array2::zeros((4, 2))));

    let comm = GeoCommunicator::new(config, &vars, Arc::clone(&training), Arc::clone(&transport))?;
    comm.send(PARAM_INIT, &training)?;

    transport.seed("ps0", "w.block0", Variable::dense_vec(vec![0.0, 0.0]));
    transport.seed("ps0", "emb.block0", Variable::Sparse(communicator::SelectedRows::empty(2, 2)));
    transport.seed("ps1", "emb.block1", Variable::Sparse(communicator::SelectedRows::empty(2, 2)));

    Ok((comm, transport, training))
}

#[test]
fn flushes_only_after_enough_steps() -> Result<()> {
    init_logs();

    let config = CommunicatorConfig {
        geo_need_push_nums: 3,
        ..config()
    };
    let (comm, transport, training) = geo(config)?;
    training.set("ids", Variable::Ids(vec![1]));

    comm.start();
    comm.send_ids(&["ids"], &["emb"], &training)?;
    comm.send_ids(&["ids"], &["emb"], &training)?;

    // Several wait budgets expire, the two steps stay buffered
    thread::sleep(Duration::from_millis(100));
    assert_eq!(transport.push_count(), 0);
    assert_eq!(transport.pull_count(), 0);
    assert_eq!(comm.flush_count(), 0);
    assert_eq!(comm.pending_steps(), 2);

    comm.send_ids(&["ids"], &["emb"], &training)?;
    assert!(eventually(|| comm.flush_count() == 1));
    comm.stop();

    // One push per dense variable and one per sparse split
    let mut names: Vec<_> = transport.pushes().into_iter().map(|push| push.name).collect();
    names.sort();
    assert_eq!(names, ["emb.block0.delta", "emb.block1.delta", "w.block0.delta"]);
    assert_eq!(transport.pull_count(), 3);

    // Splits nobody touched still push an empty delta
    let untouched = comm.delta_value("emb.block1.delta")?;
    assert!(untouched.as_sparse("emb")?.is_empty());
    assert_eq!(comm.pending_steps(), 0);

    Ok(())
}

#[test]
fn dense_values_converge_against_a_frozen_server() -> Result<()> {
    init_logs();

    let config = CommunicatorConfig {
        geo_need_push_nums: 1,
        trainers: 2,
        ..config()
    };
    let (comm, _, training) = geo(config)?;
    training.set("w", Variable::dense_vec(vec![8.0, -8.0]));

    comm.start();

    let mut deltas = Vec::new();
    for flush in 1..=6 {
        comm.send_ids(&[], &[], &training)?;
        assert!(eventually(|| comm.flush_count() == flush));

        let delta = comm.delta_value("w.delta")?;
        deltas.push(delta.as_dense("w")?[[0, 0]]);
    }
    comm.stop();

    // The server holds zeros, every flush halves the remaining drift
    assert_eq!(deltas, [4.0, 2.0, 1.0, 0.5, 0.25, 0.125]);

    let old = comm.old_value("w")?;
    let gap = (training.snapshot("w")?.as_dense("w")? - old.as_dense("w")?).mapv(f32::abs);
    assert!(gap.iter().all(|&d| d < 0.25));

    Ok(())
}

#[test]
fn server_updates_fold_into_training_values() -> Result<()> {
    init_logs();

    let config = CommunicatorConfig {
        geo_need_push_nums: 1,
        ..config()
    };
    let (comm, transport, training) = geo(config)?;

    // Another trainer moved the server while this one trained locally
    training.set("w", Variable::dense_vec(vec![1.0, 1.0]));
    transport.seed("ps0", "w.block0", Variable::dense_vec(vec![3.0, 3.0]));

    comm.start();
    comm.send_ids(&[], &[], &training)?;
    assert!(transport.wait_for_pushes(3, TIMEOUT));
    assert!(eventually(|| comm.flush_count() == 1));
    comm.stop();

    assert_eq!(training.snapshot("w")?, Variable::dense_vec(vec![3.0, 3.0]));
    assert_eq!(comm.old_value("w")?, Variable::dense_vec(vec![3.0, 3.0]));
    assert_eq!(comm.server_value("w")?, Variable::dense_vec(vec![3.0, 3.0]));

    let emb = training.snapshot("emb")?;
    assert_eq!(emb.as_dense("emb")?, &array![[0.0, 0.0], [0.0, 0.0], [0.0, 0.0], [0.0, 0.0]]);

    Ok(())
}

#[test]
fn stop_twice_leaves_the_same_state() -> Result<()> {
    init_logs();

    let (comm, _, _) = geo(config())?;

    comm.start();
    assert!(comm.is_running());
    comm.stop();
    comm.stop();
    assert!(!comm.is_running());
    assert_eq!(comm.flush_count(), 0);

    Ok(())
}
