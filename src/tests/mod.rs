mod app;
mod fakes;
mod queue;
mod search;
