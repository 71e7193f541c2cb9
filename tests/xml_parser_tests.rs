use agentmesh::tool_protocol::{AuthLevel, ParamType, ToolParameter, ToolSchema};
use agentmesh::xml_parser::{find_and_parse_xml_tool_calls, find_request_state, recover_xml};

mod common;

fn schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: "tool_information",
            description: "Discover tools.",
            summary: "Discover tools.",
            auth_level: AuthLevel::Worker,
            parameters: vec![ToolParameter {
                name: "action",
                param_type: ParamType::String,
                required: true,
                description: "list_tools or get_info",
            }],
        },
        ToolSchema {
            name: "manage_team",
            description: "Team lifecycle.",
            summary: "Team lifecycle.",
            auth_level: AuthLevel::Pm,
            parameters: vec![
                ToolParameter {
                    name: "action",
                    param_type: ParamType::String,
                    required: true,
                    description: "action",
                },
                ToolParameter {
                    name: "persona",
                    param_type: ParamType::String,
                    required: false,
                    description: "persona",
                },
            ],
        },
    ]
}

/// A fenced call with a missing opening bracket is rewritten by the
/// recovery pass and parses to one valid call.
#[test]
fn test_recovery_of_fenced_bracketless_call() {
    let input = "```tool_information><action>list_tools</action></tool_information>```";
    let names = ["tool_information", "manage_team"];
    let recovery = recover_xml(input, &names);
    assert!(recovery.was_modified);
    assert_eq!(
        recovery.recovered_xml,
        "<tool_information><action>list_tools</action></tool_information>"
    );

    let outcome = find_and_parse_xml_tool_calls(&recovery.recovered_xml, &schemas());
    assert_eq!(outcome.valid_calls.len(), 1);
    assert!(outcome.parsing_errors.is_empty());
    let call = &outcome.valid_calls[0];
    assert_eq!(call.tool_name, "tool_information");
    assert_eq!(call.args.get("action").map(String::as_str), Some("list_tools"));
}

#[test]
fn test_multiple_calls_in_one_buffer() {
    let text = "First:\n<manage_team><action>create_team</action></manage_team>\n\
                then\n<tool_information><action>list_tools</action></tool_information>";
    let outcome = find_and_parse_xml_tool_calls(text, &schemas());
    assert_eq!(outcome.valid_calls.len(), 2);
    // Buffer order is preserved.
    assert_eq!(outcome.valid_calls[0].tool_name, "manage_team");
    assert_eq!(outcome.valid_calls[1].tool_name, "tool_information");
}

#[test]
fn test_unknown_tool_blocks_are_ignored() {
    let text = "<made_up_tool><action>x</action></made_up_tool>";
    let outcome = find_and_parse_xml_tool_calls(text, &schemas());
    assert!(outcome.is_empty());
}

#[test]
fn test_parse_error_carries_corrective_example() {
    let text = "<manage_team><action>create_agent<persona>coder</persona></manage_team>";
    let outcome = find_and_parse_xml_tool_calls(text, &schemas());
    assert!(outcome.valid_calls.is_empty());
    assert_eq!(outcome.parsing_errors.len(), 1);
    let error = &outcome.parsing_errors[0];
    assert_eq!(error.tool_name, "manage_team");
    assert!(error.error_message.contains("Correct format"));
    assert!(error.error_message.contains("<manage_team>"));
}

#[test]
fn test_recover_execute_confusion_to_direct_call() {
    let input = "<tool_information><action>execute</action><tool_name>manage_team</tool_name>\
                 <parameters>action=list_agents</parameters></tool_information>";
    let recovery = recover_xml(input, &["tool_information", "manage_team"]);
    assert!(recovery.was_modified);
    assert_eq!(
        recovery.recovered_xml,
        "<manage_team><action>list_agents</action></manage_team>"
    );
}

#[test]
fn test_request_state_extraction() {
    assert_eq!(
        find_request_state("work done <request_state state='pm_standby'/> bye"),
        Some("pm_standby".to_string())
    );
    assert_eq!(
        find_request_state("<request_state state=\"worker_wait\"/>"),
        Some("worker_wait".to_string())
    );
    assert_eq!(find_request_state("<request_state>missing attr</request_state>"), None);
}
