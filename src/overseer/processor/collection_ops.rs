/// Splits the signed 32-bit hash space into `partitions` contiguous ranges,
/// rendered as `start-end` in unsigned hex.
fn hash_ranges(partitions: usize) -> Vec<Option<String>> {
    let count = partitions.max(1) as i64;
    let min = i32::MIN as i64;
    let max = i32::MAX as i64;
    let span = (max - min + 1) / count;
    (0..count)
        .map(|idx| {
            let start = min + idx * span;
            let end = if idx == count - 1 { max } else { start + span - 1 };
            Some(format!("{:08x}-{:08x}", start as i32 as u32, end as i32 as u32))
        })
        .collect()
}

fn create_collection(
    state: &ClusterState,
    message: &StateChangeMessage,
    limits: &CollectionLimits,
) -> Result<ProcessOutcome> {
    let name = message.require_str("name")?;
    validate_name("collection", &name)?;
    if state.has_collection(&name) {
        return no_op(format!("collection '{}' already exists", name));
    }

    let router = match message
        .get_str("router.name")
        .or_else(|| message.get_str("router"))
    {
        Some(raw) => raw.parse::<RouterKind>()?,
        None => RouterKind::CompositeId,
    };
    let shard_names = match message.get_str("shards") {
        Some(list) => comma_list(&list),
        None => {
            let count = message
                .get_u64("numShards")?
                .ok_or_else(|| malformed("create_collection needs 'numShards' or 'shards'"))?;
            if count > limits.max_shards_per_collection {
                return Err(malformed(format!(
                    "numShards {} exceeds the limit of {}",
                    count, limits.max_shards_per_collection
                )));
            }
            (1..=count).map(|idx| format!("shard{}", idx)).collect()
        }
    };
    if shard_names.is_empty() {
        return Err(malformed(format!("collection '{}' needs at least one shard", name)));
    }
    if shard_names.len() as u64 > limits.max_shards_per_collection {
        return Err(malformed(format!(
            "{} shards exceed the limit of {}",
            shard_names.len(),
            limits.max_shards_per_collection
        )));
    }
    for shard in &shard_names {
        validate_name("shard", shard)?;
    }

    let replication_factor =
        checked_replication_factor(message.get_u64("replicationFactor")?.unwrap_or(1), limits)?;

    let nodes: Vec<String> = match message.get_str("createNodeSet") {
        Some(list) => comma_list(&list),
        None => state.live_nodes().iter().cloned().collect(),
    };
    if nodes.is_empty() {
        return Err(malformed(format!(
            "no nodes available to place collection '{}'",
            name
        )));
    }

    let config = CollectionConfig {
        replication_factor,
        router,
        config_name: message
            .get_str("collection.configName")
            .or_else(|| message.get_str("configName")),
    };
    let ranges = match router {
        RouterKind::CompositeId => hash_ranges(shard_names.len()),
        RouterKind::Implicit => vec![None; shard_names.len()],
    };

    let mut collection = Collection::new(name.clone(), config);
    let mut placed = 0usize;
    for (shard_name, range) in shard_names.iter().zip(ranges) {
        let mut shard = Shard::new(shard_name.clone(), ShardState::Active);
        shard.range = range;
        for _ in 0..replication_factor {
            let replica_name = format!("core_node{}", placed + 1);
            let node = &nodes[placed % nodes.len()];
            shard.replicas.insert(
                replica_name.clone(),
                Replica::new(replica_name, node.clone(), ReplicaType::Nrt),
            );
            placed += 1;
        }
        collection.shards.insert(shard_name.clone(), shard);
    }

    event!(
        Level::INFO,
        collection = %name,
        shards = collection.shards.len(),
        replicas = placed,
        "creating collection"
    );
    Ok(ProcessOutcome::Delta(vec![
        StateDelta::collection(collection, None)
            .urgent(true)
            .with_event(ClusterEvent::collections_added(vec![name])),
    ]))
}

fn delete_collection(state: &ClusterState, message: &StateChangeMessage) -> Result<ProcessOutcome> {
    let name = message.require_str("name")?;
    let Some(existing) = state.collection(&name) else {
        return no_op(format!("collection '{}' does not exist", name));
    };
    event!(Level::INFO, collection = %name, "deleting collection");
    Ok(ProcessOutcome::Delta(vec![
        StateDelta::collection_deleted(&name, existing.version)
            .urgent(true)
            .with_event(ClusterEvent::collections_removed(vec![name])),
    ]))
}

fn modify_collection(
    state: &ClusterState,
    message: &StateChangeMessage,
    limits: &CollectionLimits,
) -> Result<ProcessOutcome> {
    let name = message.require_str("collection")?;
    let Some(existing) = state.collection(&name) else {
        return no_op(format!("collection '{}' does not exist", name));
    };
    let mut updated = existing.clone();
    if let Some(rf) = message.get_u64("replicationFactor")? {
        updated.config.replication_factor = checked_replication_factor(rf, limits)?;
    }
    if let Some(config_name) = message
        .get_str("collection.configName")
        .or_else(|| message.get_str("configName"))
    {
        updated.config.config_name = Some(config_name);
    }
    if updated == *existing {
        return no_op(format!("collection '{}' already has these settings", name));
    }
    Ok(ProcessOutcome::Delta(vec![StateDelta::collection(
        updated,
        Some(existing.version),
    )]))
}

fn cluster_config_changed(
    state: &ClusterState,
    message: &StateChangeMessage,
) -> Result<ProcessOutcome> {
    let name = message.require_str("name")?;
    let mut properties = state.properties().clone();
    let changed = match message.get("val") {
        None | Some(serde_json::Value::Null) => properties.values.remove(&name).is_some(),
        Some(value) => properties.values.insert(name.clone(), value.clone()).as_ref() != Some(value),
    };
    if !changed {
        return no_op(format!("cluster property '{}' unchanged", name));
    }
    Ok(ProcessOutcome::Delta(vec![
        StateDelta::cluster_properties(properties)
            .with_event(ClusterEvent::cluster_config_changed(vec![name])),
    ]))
}
