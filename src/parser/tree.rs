use super::blocks::StructureNode;

/// Nest classified blocks by structural depth.
///
/// Open levels live on an explicit stack. A heading closes every open level at
/// the same depth or deeper before it opens its own; content attaches to the
/// innermost open level and never opens one. A closed node is appended to its
/// parent only when it closes, which keeps children in document order.
pub fn build_tree(nodes: Vec<StructureNode>) -> Vec<StructureNode> {
    let mut roots = Vec::new();
    let mut open: Vec<(usize, StructureNode)> = Vec::new();

    for node in nodes {
        match node.kind.level() {
            Some(level) => {
                while open.last().is_some_and(|(top, _)| *top >= level) {
                    close_innermost(&mut open, &mut roots);
                }
                open.push((level, node));
            }
            None => match open.last_mut() {
                Some((_, parent)) => parent.children.push(node),
                None => roots.push(node),
            },
        }
    }

    while !open.is_empty() {
        close_innermost(&mut open, &mut roots);
    }
    roots
}

fn close_innermost(open: &mut Vec<(usize, StructureNode)>, roots: &mut Vec<StructureNode>) {
    if let Some((_, node)) = open.pop() {
        match open.last_mut() {
            Some((_, parent)) => parent.children.push(node),
            None => roots.push(node),
        }
    }
}
