//! Configuration renderers.
//!
//! One renderer per strategy family, all sharing the same layout: a user
//! facing frontend with per-function path ACLs, stick-table backends for
//! telemetry, and one pair of backends per function (weighted forwarding for
//! user traffic, local-only for traffic forwarded by peers).
//!
//! Requests forwarded by a peer agent carry the `X-Node-Forwarded` header
//! with the sender's node id; such requests are never forwarded again.

use crate::proxy::view::{AllLocalView, RecalcView, WeightedView};
use crate::MAX_WEIGHT;

const FORWARD_HEADER: &str = "X-Node-Forwarded";

fn push_header(out: &mut String, node_id: &str) {
    out.push_str(&format!(
        "# Managed by faasmesh-agent (node {node_id})\n# Edits are overwritten on the next strategy tick.\n\n"
    ));
}

fn push_global_defaults(out: &mut String) {
    out.push_str(concat!(
        "global\n",
        "    maxconn 50000\n",
        "    log stdout format raw local0\n",
        "\n",
        "defaults\n",
        "    mode http\n",
        "    log global\n",
        "    option httplog\n",
        "    timeout connect 5s\n",
        "    timeout client 60s\n",
        "    timeout server 120s\n",
        "\n",
    ));
}

fn push_users_table(out: &mut String, function: &str, period_secs: u64) {
    out.push_str(&format!(
        "backend st_users_func_{function}\n    stick-table type integer size 100 expire {expire}s store http_req_cnt,http_req_rate(1s)\n\n",
        expire = period_secs * 2,
    ));
}

fn push_local_table(out: &mut String, function: &str, period_secs: u64) {
    out.push_str(&format!(
        "backend st_local_func_{function}\n    stick-table type integer size 100 expire {expire}s store http_req_cnt,http_req_rate(1s)\n\n",
        expire = period_secs * 2,
    ));
}

fn push_peer_table(out: &mut String, function: &str, peer: &str, period_secs: u64) {
    out.push_str(&format!(
        "backend st_other_node_{function}_{peer}\n    stick-table type string len 128 size 100 expire {expire}s store http_req_cnt,http_req_rate(1s)\n\n",
        expire = period_secs * 2,
    ));
}

/// Render the recalc-strategy configuration.
pub fn render_recalc(view: &RecalcView) -> String {
    let mut out = String::new();
    push_header(&mut out, view.node_id.as_str());
    push_global_defaults(&mut out);

    // Frontend: ACLs, user tracking, per-peer admission limits, routing.
    out.push_str("frontend fe_functions\n    bind *:80\n");
    out.push_str(&format!(
        "    acl from_peer req.hdr({FORWARD_HEADER}) -m found\n"
    ));
    for node_id in view.nodes.keys() {
        out.push_str(&format!(
            "    acl from_peer_{id} req.hdr({FORWARD_HEADER}) -m str {id}\n",
            id = node_id
        ));
    }
    for (function, data) in &view.functions {
        out.push_str(&format!("    acl fn_{function} path /function/{function}\n"));
        out.push_str(&format!(
            "    http-request track-sc0 dst_port table st_users_func_{function} if fn_{function} !from_peer\n"
        ));
        for (node_id, limit_in) in &data.limits_in {
            out.push_str(&format!(
                "    http-request track-sc2 req.hdr({FORWARD_HEADER}) table st_other_node_{function}_{node_id} if fn_{function} from_peer_{node_id}\n"
            ));
            out.push_str(&format!(
                "    http-request deny deny_status 429 if fn_{function} from_peer_{node_id} {{ sc2_http_req_rate(st_other_node_{function}_{node_id}) gt {limit_in} }}\n"
            ));
        }
    }
    for function in view.functions.keys() {
        out.push_str(&format!(
            "    use_backend be_{function}_local if fn_{function} from_peer\n"
        ));
        out.push_str(&format!("    use_backend be_{function} if fn_{function}\n"));
    }
    out.push('\n');

    // Stick tables.
    for (function, data) in &view.functions {
        push_users_table(&mut out, function, view.period_secs);
        push_local_table(&mut out, function, view.period_secs);
        for node_id in data.limits_in.keys() {
            push_peer_table(&mut out, function, node_id.as_str(), view.period_secs);
        }
    }

    // Function backends.
    for (function, data) in &view.functions {
        let peer_weight_sum: u32 = data.weights.values().sum();
        let local_weight = MAX_WEIGHT.saturating_sub(peer_weight_sum);

        out.push_str(&format!("backend be_{function}\n    balance roundrobin\n"));
        out.push_str(&format!(
            "    http-request set-header {FORWARD_HEADER} {}\n",
            view.node_id
        ));
        if data.limit > 0 {
            out.push_str(&format!(
                "    server local {}:{} weight {local_weight}\n",
                view.gateway_host, view.gateway_port
            ));
        }
        for (node_id, weight) in &data.weights {
            if let Some(address) = view.nodes.get(node_id) {
                out.push_str(&format!(
                    "    server {node_id} {}:{} weight {weight}\n",
                    address.host, address.port
                ));
            }
        }
        out.push('\n');

        out.push_str(&format!("backend be_{function}_local\n"));
        out.push_str(&format!(
            "    http-request track-sc1 dst_port table st_local_func_{function}\n"
        ));
        if data.limit > 0 {
            out.push_str(&format!(
                "    http-request deny deny_status 429 if {{ sc1_http_req_rate(st_local_func_{function}) gt {} }}\n",
                data.limit
            ));
        } else {
            // Not deployed here; peers should not be sending it to us.
            out.push_str("    http-request deny deny_status 503\n");
        }
        out.push_str(&format!(
            "    server gateway {}:{}\n\n",
            view.gateway_host, view.gateway_port
        ));
    }

    out
}

/// Render the configuration for the weight-map strategies (node-margin and
/// static). The weight map carries the local node under its own id.
pub fn render_weighted(view: &WeightedView) -> String {
    let mut out = String::new();
    push_header(&mut out, view.node_id.as_str());
    push_global_defaults(&mut out);

    out.push_str("frontend fe_functions\n    bind *:80\n");
    out.push_str(&format!(
        "    acl from_peer req.hdr({FORWARD_HEADER}) -m found\n"
    ));
    for function in view.functions.keys() {
        out.push_str(&format!("    acl fn_{function} path /function/{function}\n"));
        out.push_str(&format!(
            "    http-request track-sc0 dst_port table st_users_func_{function} if fn_{function} !from_peer\n"
        ));
    }
    for function in view.functions.keys() {
        out.push_str(&format!(
            "    use_backend be_{function}_local if fn_{function} from_peer\n"
        ));
        out.push_str(&format!("    use_backend be_{function} if fn_{function}\n"));
    }
    out.push('\n');

    for function in view.functions.keys() {
        push_users_table(&mut out, function, view.period_secs);
    }

    for (function, data) in &view.functions {
        out.push_str(&format!("backend be_{function}\n    balance roundrobin\n"));
        out.push_str(&format!(
            "    http-request set-header {FORWARD_HEADER} {}\n",
            view.node_id
        ));
        for (node_id, weight) in &data.weights {
            if *node_id == view.node_id {
                out.push_str(&format!(
                    "    server local {}:{} weight {weight}\n",
                    view.gateway_host, view.gateway_port
                ));
            } else if let Some(address) = view.nodes.get(node_id) {
                out.push_str(&format!(
                    "    server {node_id} {}:{} weight {weight}\n",
                    address.host, address.port
                ));
            }
        }
        out.push('\n');

        out.push_str(&format!(
            "backend be_{function}_local\n    server gateway {}:{}\n\n",
            view.gateway_host, view.gateway_port
        ));
    }

    out
}

/// Render the all-local configuration: every function goes to the gateway.
pub fn render_all_local(view: &AllLocalView) -> String {
    let mut out = String::new();
    push_header(&mut out, view.node_id.as_str());
    push_global_defaults(&mut out);

    out.push_str("frontend fe_functions\n    bind *:80\n");
    for function in view.functions.keys() {
        out.push_str(&format!("    acl fn_{function} path /function/{function}\n"));
    }
    for function in view.functions.keys() {
        out.push_str(&format!("    use_backend be_{function} if fn_{function}\n"));
    }
    out.push('\n');

    for (function, timeout_ms) in &view.functions {
        out.push_str(&format!("backend be_{function}\n"));
        if let Some(ms) = timeout_ms {
            out.push_str(&format!("    timeout server {ms}ms\n"));
        }
        out.push_str(&format!(
            "    server gateway {}:{}\n\n",
            view.gateway_host, view.gateway_port
        ));
    }

    out
}
