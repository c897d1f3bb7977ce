//! Upload form.

use axum::extract::State;
use axum::response::Html;

use crate::state::AppState;
use crate::ui;

pub async fn index(State(state): State<AppState>) -> Html<String> {
    Html(ui::render_form(state.config.default_confidence))
}
