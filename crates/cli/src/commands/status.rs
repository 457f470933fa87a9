//! Status Command

use anyhow::Result;
use serde::Serialize;

use testbed_provision::TestState;

use super::Env;
use crate::output::{print_info, print_list, print_value, OutputFormat};

#[derive(Serialize)]
struct StatusDisplay {
    tag: String,
    provisioner: String,
    created_at: String,
    state_dir: String,
    installer: Option<String>,
    nodes: usize,
}

pub async fn execute(env: Env) -> Result<()> {
    let Some(state) = TestState::load_optional(&env.state_file)? else {
        print_info(&format!("No cluster recorded in {}", env.state_file.display()));
        return Ok(());
    };

    let summary = StatusDisplay {
        tag: state.tag.clone(),
        provisioner: state.provisioner.to_string(),
        created_at: state.created_at.to_rfc3339(),
        state_dir: state.provisioner_state.dir.display().to_string(),
        installer: state.provisioner_state.installer_addr.clone(),
        nodes: state.provisioner_state.nodes.len(),
    };

    match env.format {
        OutputFormat::Table => {
            print_value(&summary, env.format);
            print_list(&state.provisioner_state.nodes, env.format);
        }
        _ => print_value(&state, env.format),
    }
    Ok(())
}
