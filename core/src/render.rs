//! One-way projection of the transcript into displayable turns.
//!
//! Rendering never feeds back into the conversation: the stored raw content
//! stays the source for both re-rendering and protocol history.

use crate::conversation::{Turn, TurnRole};

pub trait MarkupRenderer {
    fn render(&self, markup: &str) -> String;
}

/// Leaves markup untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainRenderer;

impl MarkupRenderer for PlainRenderer {
    fn render(&self, markup: &str) -> String {
        markup.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTurn {
    pub role: TurnRole,
    pub body: String,
}

/// Applies `renderer` to assistant turns; user turns are shown literally.
pub fn project(turns: &[Turn], renderer: &dyn MarkupRenderer) -> Vec<RenderedTurn> {
    turns.iter().map(|turn| render_turn(turn, renderer)).collect()
}

pub fn render_turn(turn: &Turn, renderer: &dyn MarkupRenderer) -> RenderedTurn {
    let body = if turn.is_markup() {
        renderer.render(&turn.content)
    } else {
        turn.content.clone()
    };
    RenderedTurn {
        role: turn.role,
        body,
    }
}
