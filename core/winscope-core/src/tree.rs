//! Point-in-time view of the window manager's container tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Workspace that i3 and Sway use to park scratchpad windows.
pub const SCRATCH_WORKSPACE: &str = "__i3_scratch";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowNode {
    pub id: i64,
    pub pid: Option<u32>,
    /// Wayland app_id or X11 class, whichever the window reports.
    pub app_hint: Option<String>,
    pub marks: Vec<String>,
    pub workspace: Option<i32>,
    pub visible: bool,
    pub floating: bool,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowTreeSnapshot {
    pub captured_at: DateTime<Utc>,
    pub windows: Vec<WindowNode>,
    pub focused_workspace: Option<i32>,
}

impl WindowTreeSnapshot {
    pub fn find(&self, window_id: i64) -> Option<&WindowNode> {
        self.windows.iter().find(|window| window.id == window_id)
    }

    pub fn with_mark<'a>(&'a self, mark: &'a str) -> impl Iterator<Item = &'a WindowNode> + 'a {
        self.windows
            .iter()
            .filter(move |window| window.marks.iter().any(|value| value == mark))
    }
}

// ─────────────────────────────────────────────────────────────────────
// GET_TREE payload
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRect {
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawWindowProperties {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
}

/// A container node as reported by GET_TREE and window events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNode {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub num: Option<i32>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// X11 window id. i3 reports this but never a pid.
    #[serde(default)]
    pub window: Option<i64>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub window_properties: Option<RawWindowProperties>,
    #[serde(default)]
    pub marks: Vec<String>,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub rect: RawRect,
    #[serde(default)]
    pub nodes: Vec<RawNode>,
    #[serde(default)]
    pub floating_nodes: Vec<RawNode>,
}

impl RawNode {
    fn is_window(&self) -> bool {
        (self.pid().is_some() || self.window.is_some())
            && self.nodes.is_empty()
            && self.floating_nodes.is_empty()
            && matches!(self.node_type.as_str(), "con" | "floating_con")
    }

    fn pid(&self) -> Option<u32> {
        self.pid.filter(|pid| *pid > 0)
    }

    fn app_hint(&self) -> Option<String> {
        self.app_id
            .clone()
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.window_properties
                    .as_ref()
                    .and_then(|props| props.class.clone())
            })
    }
}

struct WalkContext {
    workspace: Option<i32>,
    in_scratch: bool,
    floating: bool,
}

/// Flattens a GET_TREE root into the leaf windows it contains.
pub fn flatten_tree(root: &RawNode) -> WindowTreeSnapshot {
    let mut windows = Vec::new();
    let mut focused_workspace = None;
    let context = WalkContext {
        workspace: None,
        in_scratch: false,
        floating: false,
    };
    walk(root, &context, &mut windows, &mut focused_workspace);
    windows.sort_by_key(|window| window.id);
    WindowTreeSnapshot {
        captured_at: Utc::now(),
        windows,
        focused_workspace,
    }
}

fn walk(
    node: &RawNode,
    context: &WalkContext,
    windows: &mut Vec<WindowNode>,
    focused_workspace: &mut Option<i32>,
) -> bool {
    let mut scoped = WalkContext {
        workspace: context.workspace,
        in_scratch: context.in_scratch,
        floating: context.floating,
    };
    if node.node_type == "workspace" {
        if node.name.as_deref() == Some(SCRATCH_WORKSPACE) {
            scoped.in_scratch = true;
            scoped.workspace = None;
        } else {
            scoped.workspace = node.num.filter(|num| *num >= 0);
        }
    }

    if node.is_window() {
        windows.push(WindowNode {
            id: node.id,
            pid: node.pid(),
            app_hint: node.app_hint(),
            marks: node.marks.clone(),
            workspace: scoped.workspace,
            visible: !scoped.in_scratch,
            floating: scoped.floating || node.node_type == "floating_con",
            geometry: Geometry {
                x: node.rect.x,
                y: node.rect.y,
                width: node.rect.width,
                height: node.rect.height,
            },
        });
        return node.focused;
    }

    let mut contains_focus = node.focused;
    for child in &node.nodes {
        contains_focus |= walk(child, &scoped, windows, focused_workspace);
    }
    let floating = WalkContext {
        floating: true,
        ..scoped
    };
    for child in &node.floating_nodes {
        contains_focus |= walk(child, &floating, windows, focused_workspace);
    }

    if contains_focus && node.node_type == "workspace" && focused_workspace.is_none() {
        *focused_workspace = floating.workspace;
    }
    contains_focus
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> RawNode {
        serde_json::from_value(json!({
            "id": 1,
            "type": "root",
            "nodes": [
                {
                    "id": 2,
                    "type": "output",
                    "name": "__i3",
                    "nodes": [{
                        "id": 3,
                        "type": "workspace",
                        "name": "__i3_scratch",
                        "floating_nodes": [{
                            "id": 30,
                            "type": "floating_con",
                            "pid": 300,
                            "app_id": "kitty",
                            "marks": ["winscope_scratchpad:alpha"]
                        }]
                    }]
                },
                {
                    "id": 4,
                    "type": "output",
                    "name": "DP-1",
                    "nodes": [{
                        "id": 5,
                        "type": "workspace",
                        "name": "2",
                        "num": 2,
                        "nodes": [
                            {
                                "id": 50,
                                "type": "con",
                                "pid": 500,
                                "app_id": "code",
                                "focused": true,
                                "marks": ["winscope_scoped:alpha:code:50"],
                                "rect": {"x": 0, "y": 0, "width": 800, "height": 600}
                            },
                            {
                                "id": 51,
                                "type": "con",
                                "pid": 501,
                                "window_properties": {"class": "Firefox"}
                            }
                        ]
                    }]
                }
            ]
        }))
        .expect("tree json")
    }

    #[test]
    fn flattens_leaf_windows_with_workspace() {
        let snapshot = flatten_tree(&sample_tree());
        assert_eq!(snapshot.windows.len(), 3);

        let code = snapshot.find(50).expect("code window");
        assert_eq!(code.workspace, Some(2));
        assert!(code.visible);
        assert_eq!(code.app_hint.as_deref(), Some("code"));
        assert_eq!(code.geometry.width, 800);

        let firefox = snapshot.find(51).expect("firefox window");
        assert_eq!(firefox.app_hint.as_deref(), Some("Firefox"));
    }

    #[test]
    fn scratch_workspace_means_hidden() {
        let snapshot = flatten_tree(&sample_tree());
        let terminal = snapshot.find(30).expect("scratchpad terminal");
        assert!(!terminal.visible);
        assert!(terminal.floating);
        assert_eq!(terminal.workspace, None);
    }

    #[test]
    fn focused_workspace_is_reported() {
        let snapshot = flatten_tree(&sample_tree());
        assert_eq!(snapshot.focused_workspace, Some(2));
    }

    #[test]
    fn i3_windows_without_pid_are_kept() {
        let root: RawNode = serde_json::from_value(json!({
            "id": 1,
            "type": "root",
            "nodes": [{
                "id": 2,
                "type": "output",
                "name": "eDP-1",
                "nodes": [{
                    "id": 3,
                    "type": "workspace",
                    "name": "1",
                    "num": 1,
                    "nodes": [
                        {
                            "id": 10,
                            "type": "con",
                            "window": 23068679,
                            "window_properties": {"class": "URxvt"},
                            "marks": ["winscope_scoped:alpha:urxvt:10"]
                        },
                        {
                            "id": 11,
                            "type": "con",
                            "window": null,
                            "nodes": []
                        }
                    ]
                }]
            }]
        }))
        .expect("tree json");

        let snapshot = flatten_tree(&root);
        assert_eq!(snapshot.windows.len(), 1);
        let terminal = snapshot.find(10).expect("x11 window");
        assert_eq!(terminal.pid, None);
        assert_eq!(terminal.workspace, Some(1));
        assert_eq!(terminal.marks, vec!["winscope_scoped:alpha:urxvt:10"]);
    }

    #[test]
    fn mark_lookup_finds_window() {
        let snapshot = flatten_tree(&sample_tree());
        let found: Vec<i64> = snapshot
            .with_mark("winscope_scratchpad:alpha")
            .map(|window| window.id)
            .collect();
        assert_eq!(found, vec![30]);
    }
}
