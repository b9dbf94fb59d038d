fn add_replica(
    state: &ClusterState,
    entry: &QueueEntry,
    limits: &CollectionLimits,
) -> Result<ProcessOutcome> {
    let message = &entry.message;
    let collection_name = message.require_str("collection")?;
    let shard_name = message.require_str("shard")?;
    let node_name = message
        .get_str("node")
        .or_else(|| message.get_str("node_name"))
        .ok_or_else(|| malformed("add_replica needs 'node'"))?;

    let Some(existing) = state.collection(&collection_name) else {
        return no_op(format!("collection '{}' does not exist", collection_name));
    };
    let Some(shard) = existing.shard(&shard_name) else {
        return no_op(format!("shard {}/{} does not exist", collection_name, shard_name));
    };

    // Named after the queue sequence so a replayed message finds its replica.
    let replica_name = message
        .get_str("replica")
        .unwrap_or_else(|| format!("core_node_{}", entry.sequence));
    validate_name("replica", &replica_name)?;
    if existing.find_replica(&replica_name).is_some() {
        return no_op(format!(
            "replica '{}' already exists in '{}'",
            replica_name, collection_name
        ));
    }

    if shard.replicas.len() >= limits.max_replicas_per_shard {
        return Err(malformed(format!(
            "shard {}/{} already holds {} replicas",
            collection_name, shard_name, limits.max_replicas_per_shard
        )));
    }

    let replica_type = match message.get_str("type") {
        Some(raw) => raw.parse::<ReplicaType>()?,
        None => ReplicaType::Nrt,
    };
    let mut replica = Replica::new(replica_name.clone(), node_name, replica_type);
    if let Some(raw) = message.get_str("state") {
        replica.state = raw.parse::<ReplicaState>()?;
    }

    let mut updated = existing.clone();
    if let Some(shard) = updated.shard_mut(&shard_name) {
        shard.replicas.insert(replica_name, replica);
    }
    Ok(ProcessOutcome::Delta(vec![StateDelta::collection(
        updated,
        Some(existing.version),
    )]))
}

fn remove_replica(state: &ClusterState, message: &StateChangeMessage) -> Result<ProcessOutcome> {
    let collection_name = message.require_str("collection")?;
    let shard_name = message.require_str("shard")?;
    let replica_name = message.require_str("replica")?;

    let Some(existing) = state.collection(&collection_name) else {
        return no_op(format!("collection '{}' does not exist", collection_name));
    };
    let mut updated = existing.clone();
    let Some(shard) = updated.shard_mut(&shard_name) else {
        return no_op(format!("shard {}/{} does not exist", collection_name, shard_name));
    };
    if shard.replicas.remove(&replica_name).is_none() {
        return no_op(format!("replica '{}' already removed", replica_name));
    }
    if shard.leader.as_deref() == Some(replica_name.as_str()) {
        shard.leader = None;
    }
    Ok(ProcessOutcome::Delta(vec![StateDelta::collection(
        updated,
        Some(existing.version),
    )]))
}

fn set_shard_state(state: &ClusterState, message: &StateChangeMessage) -> Result<ProcessOutcome> {
    let collection_name = message.require_str("collection")?;
    let shard_name = message.require_str("shard")?;
    let new_state = message.require_str("state")?.parse::<ShardState>()?;

    let Some(existing) = state.collection(&collection_name) else {
        return no_op(format!("collection '{}' does not exist", collection_name));
    };
    let mut updated = existing.clone();
    let Some(shard) = updated.shard_mut(&shard_name) else {
        return no_op(format!("shard {}/{} does not exist", collection_name, shard_name));
    };
    if shard.state == new_state {
        return no_op(format!("shard {} already {}", shard_name, new_state));
    }
    shard.state = new_state;
    Ok(ProcessOutcome::Delta(vec![StateDelta::collection(
        updated,
        Some(existing.version),
    )]))
}

fn set_replica_state(state: &ClusterState, message: &StateChangeMessage) -> Result<ProcessOutcome> {
    let collection_name = message.require_str("collection")?;
    let replica_name = message.require_str("replica")?;
    let new_state = message.require_str("state")?.parse::<ReplicaState>()?;

    let Some(existing) = state.collection(&collection_name) else {
        return no_op(format!("collection '{}' does not exist", collection_name));
    };
    let shard_name = match message.get_str("shard") {
        Some(shard) => shard,
        None => match existing.find_replica(&replica_name) {
            Some((shard, _)) => shard.name.clone(),
            None => return no_op(format!("replica '{}' does not exist", replica_name)),
        },
    };

    let mut updated = existing.clone();
    let Some(shard) = updated.shard_mut(&shard_name) else {
        return no_op(format!("shard {}/{} does not exist", collection_name, shard_name));
    };
    let Some(replica) = shard.replicas.get_mut(&replica_name) else {
        return no_op(format!("replica '{}' is not in {}", replica_name, shard_name));
    };
    let previous = replica.state;
    if previous == new_state {
        return no_op(format!("replica '{}' already {}", replica_name, new_state));
    }
    replica.state = new_state;
    let node_name = replica.node_name.clone();
    if let Some(cleared) = shard.clear_ineligible_leader() {
        event!(
            Level::INFO,
            collection = %collection_name,
            shard = %shard_name,
            leader = %cleared,
            "leader no longer eligible, designation cleared"
        );
    }

    let mut delta = StateDelta::collection(updated, Some(existing.version));
    if new_state == ReplicaState::Down {
        delta = delta.with_event(ClusterEvent::replicas_down(vec![ReplicaRef {
            collection: collection_name,
            shard: shard_name,
            replica: replica_name,
            node_name,
        }]));
    }
    Ok(ProcessOutcome::Delta(vec![delta]))
}

fn set_shard_leader(state: &ClusterState, message: &StateChangeMessage) -> Result<ProcessOutcome> {
    let collection_name = message.require_str("collection")?;
    let shard_name = message.require_str("shard")?;
    let replica_name = message.require_str("replica")?;

    let Some(existing) = state.collection(&collection_name) else {
        return no_op(format!("collection '{}' does not exist", collection_name));
    };
    let mut updated = existing.clone();
    let Some(shard) = updated.shard_mut(&shard_name) else {
        return no_op(format!("shard {}/{} does not exist", collection_name, shard_name));
    };
    if !shard.replicas.contains_key(&replica_name) {
        return no_op(format!("replica '{}' is not in {}", replica_name, shard_name));
    }
    if shard.leader.as_deref() == Some(replica_name.as_str()) {
        return no_op(format!("'{}' already leads {}", replica_name, shard_name));
    }
    shard.set_leader(&replica_name)?;
    event!(
        Level::INFO,
        collection = %collection_name,
        shard = %shard_name,
        leader = %replica_name,
        "shard leader assigned"
    );
    Ok(ProcessOutcome::Delta(vec![StateDelta::collection(
        updated,
        Some(existing.version),
    )]))
}

/// Marks every replica hosted on the node DOWN, one delta per collection.
fn down_node(state: &ClusterState, message: &StateChangeMessage) -> Result<ProcessOutcome> {
    let node_name = message.require_str("node_name")?;
    let mut deltas = Vec::new();
    for existing in state.collections() {
        let mut updated = existing.clone();
        let mut downed = Vec::new();
        for shard in updated.shards.values_mut() {
            for replica in shard.replicas.values_mut() {
                if replica.node_name == node_name && replica.state != ReplicaState::Down {
                    replica.state = ReplicaState::Down;
                    downed.push(ReplicaRef {
                        collection: existing.name.clone(),
                        shard: shard.name.clone(),
                        replica: replica.name.clone(),
                        node_name: node_name.clone(),
                    });
                }
            }
            shard.clear_ineligible_leader();
        }
        if !downed.is_empty() {
            deltas.push(
                StateDelta::collection(updated, Some(existing.version))
                    .with_event(ClusterEvent::replicas_down(downed)),
            );
        }
    }
    if deltas.is_empty() {
        return no_op(format!("no live replicas on node '{}'", node_name));
    }
    event!(
        Level::INFO,
        node = %node_name,
        collections = deltas.len(),
        "marked node replicas down"
    );
    Ok(ProcessOutcome::Delta(deltas))
}
