use stackful::fiber::{self, ExecutionContext, SwitchResult};

const ROUNDS: u32 = 5;

/// Bounces the ball back to whoever served it until the rally is over.
fn player(name: &'static str, mut opponent: ExecutionContext, mut ball: u32) {
    while ball < ROUNDS {
        println!("{name}: {ball}");
        let SwitchResult { from, payload } = fiber::switch::<_, u32>(opponent, ball + 1);
        (opponent, ball) = (from, payload);
    }
}

fn main() {
    let ping = fiber::create().unwrap();
    let pong = fiber::create().unwrap();

    // ping serves to pong, pong's first switch lands back on ping
    let result: SwitchResult<u32> = fiber::enter(ping, pong, move |root, pong: ExecutionContext| {
        fiber::set_return_to(root);
        let first: SwitchResult<u32> = fiber::enter(pong, 0u32, |ping, ball: u32| {
            player("pong", ping, ball);
            ROUNDS
        });
        player("ping", first.from, first.payload);
        ROUNDS
    });

    println!("rally over after {} hits, finished by {:?}", result.payload, result.from);
    fiber::destroy(ping);
    fiber::destroy(pong);
}
