//! Well-known store layout.

pub const OVERSEER_ELECTION_PATH: &str = "/overseer_elect/election";
pub const OVERSEER_QUEUE_PATH: &str = "/overseer/queue";
pub const COLLECTIONS_PATH: &str = "/collections";
pub const LIVE_NODES_PATH: &str = "/live_nodes";
pub const CLUSTER_PROPS_PATH: &str = "/clusterprops.json";

pub const STATE_JSON: &str = "state.json";
pub const ELECTION_NODE_PREFIX: &str = "n_";
pub const QUEUE_NODE_PREFIX: &str = "qn-";

pub fn collection_path(collection: &str) -> String {
    format!("{}/{}", COLLECTIONS_PATH, collection)
}

pub fn collection_state_path(collection: &str) -> String {
    format!("{}/{}/{}", COLLECTIONS_PATH, collection, STATE_JSON)
}

pub fn shard_election_path(collection: &str, shard: &str) -> String {
    format!(
        "{}/{}/leader_elect/{}/election",
        COLLECTIONS_PATH, collection, shard
    )
}

pub fn live_node_path(node_name: &str) -> String {
    format!("{}/{}", LIVE_NODES_PATH, node_name)
}

/// Parent of an absolute path; `/` is its own parent.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last segment of an absolute path.
pub fn name_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}
