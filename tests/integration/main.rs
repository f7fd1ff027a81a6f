// Integration test suite for chat-relay
//
// Organized into focused modules by feature area. HTTP modules drive the
// blocking local client over a temp database and the memory bus; component
// modules exercise the engine, presence registry, and bus directly.


mod bus;
mod lock;
mod presence;
mod rooms;
