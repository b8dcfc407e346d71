use actix_web::
{
    get,
    head,
    put,
    web,
    App,
    HttpResponse,
    HttpServer,
    Responder
};

use tokio::io::
{
    self,
    AsyncBufReadExt,
    BufReader
};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::fingerprint::Fingerprint;

pub enum ServerError
{
    BindFailed(String),
}

impl fmt::Display for ServerError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            ServerError::BindFailed(message) =>
                write!(formatter, "Server failed to bind: {}", message),
        }
    }
}

struct AppState
{
    cache_root : String,
}

impl AppState
{
    fn entry_path(&self, key : &Fingerprint) -> String
    {
        format!("{}/{}", self.cache_root, key.human_readable())
    }
}

fn parse_key(text : &str) -> Result<Fingerprint, HttpResponse>
{
    match Fingerprint::from_human_readable(text)
    {
        Ok(key) => Ok(key),
        Err(error) => Err(HttpResponse::BadRequest().body(format!("Bad key: {}", error))),
    }
}

#[get("/")]
async fn home(data : web::Data<AppState>) -> impl Responder
{
    let count =
    match fs::read_dir(&data.cache_root)
    {
        Ok(entries) => entries.count(),
        Err(_error) => 0,
    };
    HttpResponse::Ok().body(format!("quarry artifact cache: {} artifacts\n", count))
}

#[get("/artifact/{key}")]
async fn fetch_artifact(data : web::Data<AppState>, key : web::Path<String>) -> impl Responder
{
    let key =
    match parse_key(&key)
    {
        Ok(key) => key,
        Err(response) => return response,
    };

    match fs::read(data.entry_path(&key))
    {
        Ok(bytes) => HttpResponse::Ok().body(bytes),
        Err(_error) => HttpResponse::NotFound().body("MISS"),
    }
}

#[put("/artifact/{key}")]
async fn store_artifact(
    data : web::Data<AppState>,
    key : web::Path<String>,
    body : web::Bytes) -> impl Responder
{
    let key =
    match parse_key(&key)
    {
        Ok(key) => key,
        Err(response) => return response,
    };

    match fs::create_dir_all(&data.cache_root)
    {
        Ok(()) => {},
        Err(error) =>
            return HttpResponse::InternalServerError().body(format!("Cache Dir Error: {}", error)),
    }

    /*  Stores are append-only: the first blob under a key wins. */
    let path = data.entry_path(&key);
    if Path::new(&path).exists()
    {
        return HttpResponse::Ok().body("KEPT");
    }

    match fs::write(&path, &body)
    {
        Ok(()) => HttpResponse::Ok().body("OK"),
        Err(error) => HttpResponse::InternalServerError().body(format!("Write Error: {}", error)),
    }
}

#[head("/artifact/{key}")]
async fn contains_artifact(data : web::Data<AppState>, key : web::Path<String>) -> impl Responder
{
    let key =
    match parse_key(&key)
    {
        Ok(key) => key,
        Err(response) => return response,
    };

    if Path::new(&data.entry_path(&key)).exists()
    {
        HttpResponse::Ok().finish()
    }
    else
    {
        HttpResponse::NotFound().finish()
    }
}

/*  Serves the local artifact cache directory to the network over the
    cache wire contract, so other machines can layer this machine in as
    their remote cache. */
#[tokio::main]
pub async fn serve(out_root : &str, port : u16) -> Result<(), ServerError>
{
    let cache_root = format!("{}/cache", out_root);

    let app_data = web::Data::new(AppState
    {
        cache_root : cache_root,
    });

    let server = HttpServer::new(move ||
    {
        App::new()
            .app_data(app_data.clone())
            .service(home)
            .service(fetch_artifact)
            .service(store_artifact)
            .service(contains_artifact)
    })
    .disable_signals();

    let server =
    match server.bind(("0.0.0.0", port))
    {
        Ok(server) => server,
        Err(error) => return Err(ServerError::BindFailed(error.to_string())),
    };

    let server = server.run();
    let (sender, receiver) = tokio::sync::oneshot::channel();

    /*  A line on stdin shuts the server down. */
    tokio::spawn(async move
    {
        let mut reader = BufReader::new(io::stdin());
        let mut buffer = String::new();
        match reader.read_line(&mut buffer).await
        {
            Ok(_size) => {},
            Err(_error) => {},
        }
        match sender.send(())
        {
            Ok(()) => {},
            Err(_error) => {},
        }
    });

    println!("Serving artifact cache on port {}, ENTER to stop", port);
    tokio::select!
    {
        _ = server => {},
        _ = receiver =>
        {
            println!("ENTER pressed, shutting down");
        }
    }

    Ok(())
}
